//! orchard-tensor - strided tensors with device dispatch and reverse-mode autodiff.
//!
//! Tensors are shaped, strided `f32` views over reference-counted storage that
//! lives on the host or on an optional accelerator. Ops broadcast NumPy style,
//! run accelerator-first with a host fallback that produces identical results,
//! and record a backward graph whenever an operand requires gradients.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Tensor API (tensor, autodiff)
//!     → add, mul, div, sum, matmul, view, slice, backward, ...
//!
//! Level 2: Compute (operations)
//!     → broadcast resolution, output allocation, kernel launches
//!
//! Level 3: Backends (backend)
//!     → installed Accelerator, else GenericBackend (strided loops)
//!
//! Storage (storage) ──► Profiler (profiling): alloc/free/live log
//! ```
//!
//! # Example
//!
//! ```
//! use orchard_tensor::{Device, Tensor};
//!
//! let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu).unwrap();
//! let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2], Device::Cpu).unwrap();
//!
//! // Views share storage
//! let row = a.slice(0, 1, 2, 1).unwrap();
//! assert!(row.is_alias_of(&a));
//! assert_eq!(row.to_vec(), vec![3.0, 4.0]);
//!
//! // Broadcasting arithmetic and reductions
//! let c = a.add(&row).unwrap();
//! assert_eq!(c.to_vec(), vec![4.0, 6.0, 6.0, 8.0]);
//! assert_eq!(c.sum_dim(0, false).unwrap().to_vec(), vec![10.0, 14.0]);
//!
//! // Matrix product
//! assert_eq!(a.matmul(&b).unwrap().to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
//! ```

pub mod autodiff;
pub mod backend;
pub mod broadcast;
pub mod device;
pub mod error;
pub mod layout;
pub(crate) mod operations;
pub mod profiling;
pub mod storage;
pub mod strides;
pub mod tensor;

pub use backend::{Accelerator, Backend, GenericBackend, KernelOp, install_accelerator, uninstall_accelerator};
pub use device::{DType, Device};
pub use error::{KernelError, Result, TensorError};
pub use layout::{Layout, PackedLayout};
pub use storage::{ReleaseFn, Storage};
pub use tensor::Tensor;
