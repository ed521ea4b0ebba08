//! Reverse-mode automatic differentiation.
//!
//! Gradient tracking is opt-in per tensor with
//! [`Tensor::set_requires_grad`](crate::Tensor::set_requires_grad). Every
//! tracked op records a node as the producer of its output; calling
//! [`Tensor::backward`](crate::Tensor::backward) on a result walks those nodes
//! and accumulates gradients into every tensor on the way.
//!
//! # Architecture
//!
//! ```text
//! Tensor ──► AutogradMeta ──grad_fn──► Node (Arc, shared by outputs)
//!                 │                     │
//!                 ▼                     ├── GradFn (MulBackward, ...)
//!             GradSlot ◄──edge.slot─────┤      └── SavedTensor (version checked)
//!                                       └── edge.producer ──► Node (upstream)
//! ```
//!
//! # Example
//!
//! ```
//! use orchard_tensor::{Device, Tensor};
//!
//! let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3], Device::Cpu).unwrap();
//! x.set_requires_grad(true);
//!
//! // y is consumed twice; x still receives each contribution exactly once
//! let y = x.mul(&x).unwrap();
//! let loss = y.add(&y).unwrap().sum().unwrap();
//! loss.backward().unwrap();
//!
//! assert_eq!(x.grad().unwrap().to_vec(), vec![4.0, 8.0, 12.0]);
//! ```
//!
//! # Design Notes
//!
//! - Nodes are `Arc`-shared and `Send + Sync`; the graph lives as long as
//!   the tensors that reference it.
//! - Backward is a dependency-counted worklist, so diamond graphs are exact.
//! - In-place ops start a fresh gradient slot; edges that captured the old
//!   slot keep delivering to the value they consumed.

mod backward;
mod gradients;
pub(crate) mod graph;
mod ops;
mod saved_tensor;

pub use backward::backward;
pub use graph::{Node, NodeId};
