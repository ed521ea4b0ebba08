//! C API for orchard-tensor
//!
//! This crate provides a C-compatible interface to the orchard-tensor library:
//! tensor creation (including zero-copy wrapping of caller memory with a
//! release callback), the op surface, backward and gradient read-back, and
//! the profiling controls.
//!
//! Every function reports failures through a [`StatusCode`]; panics are
//! caught at the boundary and reported as [`OT_INTERNAL_ERROR`]. Tensor
//! handles returned by this API are owned by the caller and must be freed
//! with [`ot_tensor_release`].
//!
//! All extern "C" functions are inherently unsafe as they work with raw pointers
//! from foreign code. The `#[unsafe(no_mangle)]` attribute marks the entire
//! function signature as unsafe at the FFI boundary.

#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(non_camel_case_types)]

use libc::{c_float, c_int, c_void, size_t};
use orchard_tensor::strides::linear_to_cartesian;
use orchard_tensor::{DType, Device, ReleaseFn, Tensor, TensorError, profiling};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const OT_SUCCESS: StatusCode = 0;
pub const OT_INVALID_ARGUMENT: StatusCode = -1;
pub const OT_SHAPE_MISMATCH: StatusCode = -2;
pub const OT_INDEX_OUT_OF_BOUNDS: StatusCode = -3;
pub const OT_INTERNAL_ERROR: StatusCode = -4;
pub const OT_DIVIDE_BY_ZERO: StatusCode = -5;
pub const OT_DEVICE_ERROR: StatusCode = -6;
pub const OT_ALLOCATION_FAILURE: StatusCode = -7;
pub const OT_SAVED_TENSOR_MODIFIED: StatusCode = -8;

// Device codes
pub const OT_DEVICE_CPU: c_int = 0;
pub const OT_DEVICE_ACCELERATOR: c_int = 1;

/// Callback releasing wrapped memory: `(data, context)`.
pub type ot_release_fn = Option<extern "C" fn(*mut c_void, *mut c_void)>;

/// Opaque tensor handle
#[repr(C)]
pub struct ot_tensor {
    _private: *mut c_void,
}

impl ot_tensor {
    fn from_tensor(tensor: Tensor) -> Self {
        let boxed = Box::new(tensor);
        Self {
            _private: Box::into_raw(boxed) as *mut c_void,
        }
    }

    fn inner(&self) -> &Tensor {
        unsafe { &*(self._private as *const Tensor) }
    }
}

impl Drop for ot_tensor {
    fn drop(&mut self) {
        if !self._private.is_null() {
            unsafe {
                let _ = Box::from_raw(self._private as *mut Tensor);
            }
        }
    }
}

fn status_of(err: &TensorError) -> StatusCode {
    match err {
        TensorError::ShapeMismatch { .. }
        | TensorError::RankMismatch { .. }
        | TensorError::LengthMismatch { .. }
        | TensorError::NonContiguous
        | TensorError::InvalidExtent { .. }
        | TensorError::RankOverflow { .. } => OT_SHAPE_MISMATCH,
        TensorError::IndexOutOfBounds { .. }
        | TensorError::WrongNumberOfIndices { .. }
        | TensorError::DimOutOfRange { .. }
        | TensorError::InvalidSlice { .. }
        | TensorError::OutOfBounds { .. } => OT_INDEX_OUT_OF_BOUNDS,
        TensorError::DivideByZero => OT_DIVIDE_BY_ZERO,
        TensorError::DeviceUnavailable { .. } | TensorError::DeviceMismatch { .. } => OT_DEVICE_ERROR,
        TensorError::AllocationFailure { .. } | TensorError::ShapeOverflow { .. } => {
            OT_ALLOCATION_FAILURE
        }
        TensorError::SavedTensorModified { .. } => OT_SAVED_TENSOR_MODIFIED,
        TensorError::Misaligned { .. } | TensorError::NullPointer | TensorError::NotScalar { .. } => {
            OT_INVALID_ARGUMENT
        }
        TensorError::Kernel(_) => OT_INTERNAL_ERROR,
    }
}

/// Run `f`, catching panics, and report its outcome through `status`.
fn guard<T>(status: *mut StatusCode, fallback: T, f: impl FnOnce() -> Result<T, StatusCode>) -> T {
    let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(OT_INTERNAL_ERROR));
    let (value, code) = match result {
        Ok(value) => (value, OT_SUCCESS),
        Err(code) => (fallback, code),
    };
    if !status.is_null() {
        unsafe {
            *status = code;
        }
    }
    value
}

/// Like [`guard`] for functions that only return a status.
fn guard_status(f: impl FnOnce() -> Result<(), StatusCode>) -> StatusCode {
    let mut status = OT_SUCCESS;
    guard(&mut status, (), f);
    status
}

fn check<T>(result: orchard_tensor::Result<T>) -> Result<T, StatusCode> {
    result.map_err(|err| status_of(&err))
}

fn tensor_ref<'a>(tensor: *const ot_tensor) -> Result<&'a Tensor, StatusCode> {
    if tensor.is_null() {
        return Err(OT_INVALID_ARGUMENT);
    }
    Ok(unsafe { (*tensor).inner() })
}

fn new_handle(tensor: Tensor) -> *mut ot_tensor {
    Box::into_raw(Box::new(ot_tensor::from_tensor(tensor)))
}

fn device_of(code: c_int) -> Result<Device, StatusCode> {
    match code {
        OT_DEVICE_CPU => Ok(Device::Cpu),
        OT_DEVICE_ACCELERATOR => Ok(Device::Accelerator),
        _ => Err(OT_INVALID_ARGUMENT),
    }
}

fn shape_slice<'a>(shape: *const size_t, ndim: size_t) -> Result<&'a [usize], StatusCode> {
    if ndim == 0 {
        return Ok(&[]);
    }
    if shape.is_null() {
        return Err(OT_INVALID_ARGUMENT);
    }
    Ok(unsafe { std::slice::from_raw_parts(shape, ndim) })
}

// ============================================================================
// Tensor creation functions
// ============================================================================

/// Create a new tensor filled with zeros.
///
/// # Arguments
/// * `shape` - Pointer to array of dimensions
/// * `ndim` - Number of dimensions
/// * `device` - `OT_DEVICE_CPU` or `OT_DEVICE_ACCELERATOR`
/// * `status` - Pointer to receive status code
///
/// # Returns
/// Pointer to new tensor, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_zeros(
    shape: *const size_t,
    ndim: size_t,
    device: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        let tensor = check(Tensor::zeros(shape_slice(shape, ndim)?, device_of(device)?))?;
        Ok(new_handle(tensor))
    })
}

/// Create a new tensor from row-major data.
///
/// # Arguments
/// * `data` - Pointer to data array (row-major order)
/// * `len` - Length of data array
/// * `shape` - Pointer to array of dimensions
/// * `ndim` - Number of dimensions
/// * `device` - Device code
/// * `status` - Pointer to receive status code
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_from_data(
    data: *const c_float,
    len: size_t,
    shape: *const size_t,
    ndim: size_t,
    device: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        if data.is_null() {
            return Err(OT_INVALID_ARGUMENT);
        }
        let data = unsafe { std::slice::from_raw_parts(data, len) };
        let tensor = check(Tensor::from_slice(data, shape_slice(shape, ndim)?, device_of(device)?))?;
        Ok(new_handle(tensor))
    })
}

/// Create a zero tensor from 8 shape slots; rank is the number of leading
/// positive slots.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_from_slots(
    slots: *const i64,
    device: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        if slots.is_null() {
            return Err(OT_INVALID_ARGUMENT);
        }
        let slots = unsafe { &*(slots as *const [i64; 8]) };
        let tensor = check(Tensor::from_slots(slots, device_of(device)?))?;
        Ok(new_handle(tensor))
    })
}

/// Wrap caller memory as a dense tensor without copying.
///
/// `release`, when non-null, is called exactly once with `(data, context)`
/// after the last tensor referencing the memory is released. It is not
/// called when this function fails.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_wrap(
    data: *mut c_float,
    shape: *const size_t,
    ndim: size_t,
    device: c_int,
    release: ot_release_fn,
    context: *mut c_void,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        let shape = shape_slice(shape, ndim)?;
        let device = device_of(device)?;
        let context = context as usize;
        let release = release.map(|callback| -> ReleaseFn {
            Box::new(move |ptr| callback(ptr.as_ptr().cast(), context as *mut c_void))
        });
        let tensor = check(unsafe { Tensor::from_raw_parts(data, shape, DType::F32, device, release) })?;
        Ok(new_handle(tensor))
    })
}

// ============================================================================
// Tensor lifecycle functions
// ============================================================================

/// Release (free) a tensor handle.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_release(tensor: *mut ot_tensor) {
    if !tensor.is_null() {
        unsafe {
            let _ = Box::from_raw(tensor);
        }
    }
}

/// New handle sharing storage and gradient state with `tensor`.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_share(tensor: *const ot_tensor) -> *mut ot_tensor {
    match tensor_ref(tensor) {
        Ok(tensor) => new_handle(tensor.clone()),
        Err(_) => ptr::null_mut(),
    }
}

/// Deep copy into fresh storage (differentiable).
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_clone(tensor: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, Tensor::deep_clone)
}

/// Alias with gradients off.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_detach(tensor: *const ot_tensor) -> *mut ot_tensor {
    match tensor_ref(tensor) {
        Ok(tensor) => new_handle(tensor.detach()),
        Err(_) => ptr::null_mut(),
    }
}

/// 1 if both tensors address the same storage, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_is_alias_of(a: *const ot_tensor, b: *const ot_tensor) -> c_int {
    match (tensor_ref(a), tensor_ref(b)) {
        (Ok(a), Ok(b)) => c_int::from(a.is_alias_of(b)),
        _ => 0,
    }
}

// ============================================================================
// Tensor query and element access
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_ndim(tensor: *const ot_tensor) -> size_t {
    tensor_ref(tensor).map_or(0, Tensor::ndim)
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_numel(tensor: *const ot_tensor) -> size_t {
    tensor_ref(tensor).map_or(0, Tensor::numel)
}

/// Device code of the tensor, or -1 for a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_device(tensor: *const ot_tensor) -> c_int {
    match tensor_ref(tensor).map(Tensor::device) {
        Ok(Device::Cpu) => OT_DEVICE_CPU,
        Ok(Device::Accelerator) => OT_DEVICE_ACCELERATOR,
        Err(_) => -1,
    }
}

/// Write the dimensions into `out_shape`, which must hold `ndim` entries.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_shape(tensor: *const ot_tensor, out_shape: *mut size_t) -> StatusCode {
    guard_status(|| {
        let tensor = tensor_ref(tensor)?;
        if out_shape.is_null() {
            return Err(OT_INVALID_ARGUMENT);
        }
        unsafe { ptr::copy_nonoverlapping(tensor.shape().as_ptr(), out_shape, tensor.ndim()) };
        Ok(())
    })
}

/// Copy the elements, in row-major order, into `out` of length `len`.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_copy_data(tensor: *const ot_tensor, out: *mut c_float, len: size_t) -> StatusCode {
    guard_status(|| {
        let tensor = tensor_ref(tensor)?;
        if out.is_null() {
            return Err(OT_INVALID_ARGUMENT);
        }
        if len != tensor.numel() {
            return Err(OT_SHAPE_MISMATCH);
        }
        let out = unsafe { std::slice::from_raw_parts_mut(out, len) };
        for (dst, value) in out.iter_mut().zip(tensor.values()) {
            *dst = value;
        }
        Ok(())
    })
}

fn linear_index(tensor: &Tensor, index: size_t) -> Result<Vec<usize>, StatusCode> {
    if index >= tensor.numel() {
        return Err(OT_INDEX_OUT_OF_BOUNDS);
    }
    Ok(linear_to_cartesian(index, tensor.shape()).to_vec())
}

/// Get element by row-major linear index.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_get_linear(tensor: *const ot_tensor, index: size_t, out: *mut c_float) -> StatusCode {
    guard_status(|| {
        let tensor = tensor_ref(tensor)?;
        if out.is_null() {
            return Err(OT_INVALID_ARGUMENT);
        }
        let value = check(tensor.get(&linear_index(tensor, index)?))?;
        unsafe { *out = value };
        Ok(())
    })
}

/// Set element by row-major linear index.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_set_linear(tensor: *mut ot_tensor, index: size_t, value: c_float) -> StatusCode {
    guard_status(|| {
        let tensor = tensor_ref(tensor)?;
        check(tensor.set(&linear_index(tensor, index)?, value))
    })
}

/// Fill tensor with a value.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_fill(tensor: *mut ot_tensor, value: c_float) -> StatusCode {
    guard_status(|| check(tensor_ref(tensor)?.fill(value)))
}

// ============================================================================
// Operations
// ============================================================================

fn unary(
    tensor: *const ot_tensor,
    status: *mut StatusCode,
    op: impl FnOnce(&Tensor) -> orchard_tensor::Result<Tensor>,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || Ok(new_handle(check(op(tensor_ref(tensor)?))?)))
}

fn binary(
    a: *const ot_tensor,
    b: *const ot_tensor,
    status: *mut StatusCode,
    op: impl FnOnce(&Tensor, &Tensor) -> orchard_tensor::Result<Tensor>,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        Ok(new_handle(check(op(tensor_ref(a)?, tensor_ref(b)?))?))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_add(a: *const ot_tensor, b: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    binary(a, b, status, Tensor::add)
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_mul(a: *const ot_tensor, b: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    binary(a, b, status, Tensor::mul)
}

/// Elementwise divide; with `safe` non-zero, zero divisors yield 0.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_div(
    a: *const ot_tensor,
    b: *const ot_tensor,
    safe: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    binary(a, b, status, |a, b| a.div(b, safe != 0))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_matmul(a: *const ot_tensor, b: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    binary(a, b, status, Tensor::matmul)
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_add_scalar(tensor: *const ot_tensor, scalar: c_float, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, |t| t.add_scalar(scalar))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_mul_scalar(tensor: *const ot_tensor, scalar: c_float, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, |t| t.mul_scalar(scalar))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_div_scalar(
    tensor: *const ot_tensor,
    scalar: c_float,
    safe: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    unary(tensor, status, |t| t.div_scalar(scalar, safe != 0))
}

/// Divide in place by a scalar.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_div_(tensor: *mut ot_tensor, scalar: c_float, safe: c_int) -> StatusCode {
    guard_status(|| check(tensor_ref(tensor)?.div_(scalar, safe != 0)))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_sum(tensor: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, Tensor::sum)
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_mean(tensor: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, Tensor::mean)
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_sum_dim(
    tensor: *const ot_tensor,
    dim: size_t,
    keepdim: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    unary(tensor, status, |t| t.sum_dim(dim, keepdim != 0))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_mean_dim(
    tensor: *const ot_tensor,
    dim: size_t,
    keepdim: c_int,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    unary(tensor, status, |t| t.mean_dim(dim, keepdim != 0))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_view(
    tensor: *const ot_tensor,
    shape: *const size_t,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        let view = check(tensor_ref(tensor)?.view(shape_slice(shape, ndim)?))?;
        Ok(new_handle(view))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_slice(
    tensor: *const ot_tensor,
    dim: size_t,
    start: size_t,
    end: size_t,
    step: size_t,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    unary(tensor, status, |t| t.slice(dim, start, end, step))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_transpose(
    tensor: *const ot_tensor,
    dim0: size_t,
    dim1: size_t,
    status: *mut StatusCode,
) -> *mut ot_tensor {
    unary(tensor, status, |t| t.transpose(dim0, dim1))
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_contiguous(tensor: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    unary(tensor, status, Tensor::contiguous)
}

/// Copy (or alias, when already there) onto `device`.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_to(tensor: *const ot_tensor, device: c_int, status: *mut StatusCode) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        let device = device_of(device)?;
        Ok(new_handle(check(tensor_ref(tensor)?.to(device))?))
    })
}

// ============================================================================
// Autograd
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_set_requires_grad(tensor: *mut ot_tensor, requires_grad: c_int) -> StatusCode {
    guard_status(|| {
        tensor_ref(tensor)?.set_requires_grad(requires_grad != 0);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_requires_grad(tensor: *const ot_tensor) -> c_int {
    tensor_ref(tensor).map_or(0, |t| c_int::from(t.requires_grad()))
}

/// Backpropagate from `tensor`.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_backward(tensor: *const ot_tensor) -> StatusCode {
    guard_status(|| check(tensor_ref(tensor)?.backward()))
}

/// Handle to the accumulated gradient.
///
/// Returns null with `OT_SUCCESS` when no gradient has been accumulated.
#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_grad(tensor: *const ot_tensor, status: *mut StatusCode) -> *mut ot_tensor {
    guard(status, ptr::null_mut(), || {
        Ok(tensor_ref(tensor)?.grad().map_or(ptr::null_mut(), new_handle))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ot_tensor_zero_grad(tensor: *mut ot_tensor) -> StatusCode {
    guard_status(|| {
        tensor_ref(tensor)?.zero_grad();
        Ok(())
    })
}

// ============================================================================
// Profiling
// ============================================================================

/// 1 when allocation profiling is enabled.
#[unsafe(no_mangle)]
pub extern "C" fn ot_profile_enabled() -> c_int {
    c_int::from(profiling::profile_enabled())
}

/// Re-read the enable flag from the environment on next use.
#[unsafe(no_mangle)]
pub extern "C" fn ot_profile_reset() {
    profiling::profile_reset();
}

/// Append one "live" line per live storage.
#[unsafe(no_mangle)]
pub extern "C" fn ot_profile_dump_live() {
    profiling::dump_live();
}

/// Delete the profiling log.
#[unsafe(no_mangle)]
pub extern "C" fn ot_profile_clear_log() -> StatusCode {
    guard_status(|| profiling::clear_log().map_err(|_| OT_INTERNAL_ERROR))
}
