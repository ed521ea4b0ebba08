//! Tensor operations.
//!
//! Every public op is a `Tensor` method and follows the same layering:
//!
//! ```text
//! Level 1: Tracked API (Tensor::add, Tensor::matmul, ...; see autodiff)
//!     → validate, compute, record a backward node
//!
//! Level 2: Untracked compute (this module)
//!     → resolve broadcasting, allocate the output, build a launch
//!
//! Level 3: Backend (backend module)
//!     → accelerator first, GenericBackend fallback
//! ```

pub(crate) mod compute;
