//! Tracked tensor operations with automatic differentiation.
//!
//! Each file pairs the public `Tensor` methods with the backward functions
//! they record.

mod elementwise;
mod linalg;
mod reduce;
mod shape;
