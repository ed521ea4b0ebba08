//! Saved tensor for backward pass.

use crate::error::{Result, TensorError};
use crate::tensor::Tensor;

/// Operand value kept by a backward function.
///
/// Holds a detached alias of the operand plus the storage version at save
/// time. In-place writes bump the version, so a value overwritten after it
/// was saved is reported instead of silently producing a wrong gradient.
#[derive(Debug, Clone)]
pub(crate) struct SavedTensor {
    tensor: Tensor,
    version: u64,
}

impl SavedTensor {
    /// Save an alias of `tensor`.
    pub(crate) fn new(tensor: &Tensor) -> Self {
        Self {
            version: tensor.storage().version(),
            tensor: tensor.detach(),
        }
    }

    /// Save a value that nothing else can write to, such as a fresh copy.
    pub(crate) fn owned(tensor: Tensor) -> Self {
        Self::new(&tensor)
    }

    /// The saved value, if it has not been overwritten since.
    pub(crate) fn value(&self, op: &'static str) -> Result<&Tensor> {
        if self.tensor.storage().version() != self.version {
            return Err(TensorError::SavedTensorModified { op });
        }
        Ok(&self.tensor)
    }
}
