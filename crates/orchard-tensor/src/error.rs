//! Error types for orchard-tensor.

use crate::device::Device;
use crate::strides::Dims;
use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, TensorError>;

/// Errors that can occur in tensor operations.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Operand shapes are incompatible (broadcast, matmul, view).
    #[error("shape mismatch: {lhs:?} is incompatible with {rhs:?}")]
    ShapeMismatch { lhs: Dims, rhs: Dims },

    /// Unsafe division with a zero divisor present.
    #[error("division by zero")]
    DivideByZero,

    /// The accelerator was requested but none is installed.
    #[error("device {device} is unavailable")]
    DeviceUnavailable { device: Device },

    /// The requested allocation could not be satisfied.
    #[error("failed to allocate {nbytes} bytes on {device}")]
    AllocationFailure { nbytes: usize, device: Device },

    /// Element count or storage span does not fit in `usize`.
    #[error("shape {dims:?} addresses more elements than fit in memory")]
    ShapeOverflow { dims: Dims },

    /// More axes than a descriptor can hold.
    #[error("rank {rank} exceeds the maximum of {}", crate::strides::MAX_RANK)]
    RankOverflow { rank: usize },

    /// A zero extent inside the rank.
    #[error("extent of dimension {dim} must be positive")]
    InvalidExtent { dim: usize },

    /// Axis index outside the tensor rank.
    #[error("dimension {dim} out of range for tensor of rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Slice range out of bounds or empty.
    #[error("slice {start}..{end} step {step} invalid for dimension {dim} with size {size}")]
    InvalidSlice {
        dim: usize,
        start: usize,
        end: usize,
        step: usize,
        size: usize,
    },

    /// Operation requires specific tensor rank.
    #[error("expected tensor of rank {expected}, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// Data length does not match the element count of the shape.
    #[error("length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// `view` of a tensor whose strides are not dense.
    #[error("view requires a contiguous tensor")]
    NonContiguous,

    /// Descriptor addresses past the end of its storage.
    #[error("layout needs {required} elements but storage holds {capacity}")]
    OutOfBounds { required: usize, capacity: usize },

    /// Foreign pointer does not satisfy the device alignment.
    #[error("pointer {addr:#x} is not aligned to {alignment} bytes")]
    Misaligned { addr: usize, alignment: usize },

    /// Foreign pointer is null.
    #[error("null data pointer")]
    NullPointer,

    /// Operands live on different devices.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: Device, rhs: Device },

    /// A single value was requested from a tensor with several elements.
    #[error("expected a single element, tensor has {numel}")]
    NotScalar { numel: usize },

    /// A value saved for backward was overwritten in place.
    #[error("a tensor saved for {op} was modified in place before backward")]
    SavedTensorModified { op: &'static str },

    /// Host kernel rejected a launch.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Failure of a kernel launch.
///
/// Accelerators return this from [`Accelerator::launch`](crate::backend::Accelerator::launch);
/// the dispatcher treats every variant as recoverable and recomputes on the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// The backend has no kernel for this op.
    #[error("{op} is not supported by this backend")]
    Unsupported { op: &'static str },

    /// The device went away or never came up.
    #[error("device unavailable")]
    Unavailable,

    /// The device API reported an error.
    #[error("device error: {0}")]
    Device(String),

    /// Device memory exhausted.
    #[error("out of device memory allocating {nbytes} bytes")]
    OutOfMemory { nbytes: usize },

    /// Operand or output descriptors do not fit the op.
    #[error("invalid launch for {op}: {reason}")]
    InvalidLaunch {
        op: &'static str,
        reason: &'static str,
    },
}
