//! Tensor handle over shared storage.
//!
//! ```text
//! Tensor ─┬─ Storage ──Arc──► Allocation   (shared by every view)
//!         ├─ Layout                        (extents, strides, offset)
//!         ├─ DType
//!         └─ AutogradMeta ─► Node          (producer, when tracked)
//! ```
//!
//! `Tensor::clone` is a shallow handle copy: both handles address the same
//! memory and share gradient state. [`Tensor::deep_clone`] copies the data
//! into fresh storage.
//!
//! # Concurrency
//!
//! Unrelated tensors may be created, used and dropped from any thread. There
//! is no locking around element data: a tensor (or any alias of its storage)
//! must not be written from one thread while another thread reads or writes
//! it.

use crate::autodiff::backward;
use crate::autodiff::graph::{AutogradMeta, Node};
use crate::device::{DType, Device};
use crate::error::{Result, TensorError};
use crate::layout::Layout;
use crate::operations::compute;
use crate::storage::{ReleaseFn, Storage};
use crate::strides::MAX_RANK;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Strided `f32` tensor on a host or accelerator storage.
#[derive(Clone, Debug)]
pub struct Tensor {
    storage: Storage,
    layout: Layout,
    dtype: DType,
    pub(crate) autograd: Arc<AutogradMeta>,
}

/// Dense layout for `shape` and the bytes backing it.
fn dense_layout(shape: &[usize], dtype: DType, device: Device) -> Result<(Layout, usize)> {
    let layout = Layout::contiguous(shape).map_err(|err| unsatisfiable(err, device))?;
    let nbytes = layout
        .numel()
        .checked_mul(dtype.size_in_bytes())
        .ok_or(TensorError::AllocationFailure {
            nbytes: usize::MAX,
            device,
        })?;
    Ok((layout, nbytes))
}

/// No device can hold a shape whose size overflows `usize`.
fn unsatisfiable(err: TensorError, device: Device) -> TensorError {
    match err {
        TensorError::ShapeOverflow { .. } => TensorError::AllocationFailure {
            nbytes: usize::MAX,
            device,
        },
        other => other,
    }
}

impl Tensor {
    /// Tensor over `storage` addressed through `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::OutOfBounds`] when the layout addresses past
    /// the end of the storage.
    pub fn from_storage(storage: Storage, layout: Layout, dtype: DType) -> Result<Self> {
        let capacity = storage.capacity(dtype);
        let required = layout.span();
        if required > capacity {
            return Err(TensorError::OutOfBounds { required, capacity });
        }
        Ok(Self {
            storage,
            layout,
            dtype,
            autograd: Arc::new(AutogradMeta::new(false)),
        })
    }

    /// Untracked alias of the same storage with another layout.
    pub(crate) fn with_layout(&self, layout: Layout) -> Self {
        Self {
            storage: self.storage.clone(),
            layout,
            dtype: self.dtype,
            autograd: Arc::new(AutogradMeta::new(false)),
        }
    }

    /// Zero-filled dense tensor.
    ///
    /// # Errors
    ///
    /// [`TensorError::AllocationFailure`] when the memory cannot be obtained,
    /// including shapes whose byte count overflows `usize`.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let t = Tensor::empty(&[2, 3, 4], Device::Cpu).unwrap();
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.numel(), 24);
    /// assert_eq!(t.strides(), &[12, 4, 1]);
    /// ```
    pub fn empty(shape: &[usize], device: Device) -> Result<Self> {
        let dtype = DType::F32;
        let (layout, nbytes) = dense_layout(shape, dtype, device)?;
        let storage = Storage::allocate(nbytes, device)?;
        Self::from_storage(storage, layout, dtype)
    }

    pub fn zeros(shape: &[usize], device: Device) -> Result<Self> {
        Self::empty(shape, device)
    }

    pub fn ones(shape: &[usize], device: Device) -> Result<Self> {
        Self::full(shape, 1.0, device)
    }

    /// Dense tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: f32, device: Device) -> Result<Self> {
        let tensor = Self::empty(shape, device)?;
        compute::fill(&tensor, value)?;
        Ok(tensor)
    }

    /// Zeros with the shape and device of `self`.
    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape(), self.device())
    }

    /// Ones with the shape and device of `self`.
    pub fn ones_like(&self) -> Result<Self> {
        Self::ones(self.shape(), self.device())
    }

    /// Rank-0 tensor holding `value`.
    pub fn scalar(value: f32, device: Device) -> Result<Self> {
        Self::full(&[], value, device)
    }

    /// Create tensor from row-major data and shape.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::LengthMismatch`] if the data length doesn't
    /// match the shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], Device::Cpu).unwrap();
    /// assert_eq!(t.get(&[0, 1]).unwrap(), 2.0);
    /// assert_eq!(t.get(&[1, 0]).unwrap(), 4.0);
    /// ```
    pub fn from_vec(data: Vec<f32>, shape: &[usize], device: Device) -> Result<Self> {
        Self::from_slice(&data, shape, device)
    }

    /// Like [`Tensor::from_vec`], copying from a slice.
    pub fn from_slice(data: &[f32], shape: &[usize], device: Device) -> Result<Self> {
        let tensor = Self::empty(shape, device)?;
        tensor.copy_from_slice(data)?;
        Ok(tensor)
    }

    /// Zero-filled tensor whose shape is given as 8 slots.
    ///
    /// Rank is the number of leading positive slots.
    pub fn from_slots(slots: &[i64; MAX_RANK], device: Device) -> Result<Self> {
        let layout = Layout::from_slots(slots).map_err(|err| unsatisfiable(err, device))?;
        Self::empty(layout.dims(), device)
    }

    /// Dense tensor over foreign memory, without copying.
    ///
    /// `release`, when given, runs once with the original pointer after the
    /// last handle (including views) drops.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of the whole shape until the
    /// storage is released.
    ///
    /// # Errors
    ///
    /// [`TensorError::NullPointer`] and [`TensorError::Misaligned`] for
    /// pointers the device cannot address. [`TensorError::AllocationFailure`]
    /// for shapes whose byte count overflows `usize`.
    pub unsafe fn from_raw_parts(
        ptr: *mut f32,
        shape: &[usize],
        dtype: DType,
        device: Device,
        release: Option<ReleaseFn>,
    ) -> Result<Self> {
        let (layout, nbytes) = dense_layout(shape, dtype, device)?;
        // SAFETY: forwarded from the caller.
        let storage = unsafe { Storage::wrap(ptr.cast(), nbytes, device, release) }?;
        Self::from_storage(storage, layout, dtype)
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.dims()
    }

    /// Element strides.
    #[inline]
    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    /// Element offset into the storage.
    #[inline]
    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    /// Get the rank (number of dimensions).
    #[inline]
    pub fn ndim(&self) -> usize {
        self.layout.rank()
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.layout.numel()
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether both tensors address the same storage.
    pub fn is_alias_of(&self, other: &Tensor) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    /// Pointer to the first addressed element.
    pub fn data_ptr(&self) -> *mut f32 {
        self.base().wrapping_add(self.layout.offset())
    }

    fn base(&self) -> *mut f32 {
        self.storage.as_ptr().cast()
    }

    /// Get element at the given multi-index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let offset = self.layout.offset_at(index)?;
        // SAFETY: bounds checked by `offset_at`; the layout fits the storage.
        Ok(unsafe { *self.base().add(offset) })
    }

    /// Set element at the given multi-index.
    ///
    /// Visible through every alias of the storage.
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        let offset = self.layout.offset_at(index)?;
        // SAFETY: as in `get`.
        unsafe { *self.base().add(offset) = value };
        self.bump_version();
        Ok(())
    }

    /// Set every addressed element to `value`.
    pub fn fill(&self, value: f32) -> Result<()> {
        compute::fill(self, value)?;
        self.bump_version();
        Ok(())
    }

    /// Overwrite the addressed elements from row-major `data`.
    pub fn copy_from_slice(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.numel() {
            return Err(TensorError::LengthMismatch {
                expected: self.numel(),
                actual: data.len(),
            });
        }
        let base = self.base();
        for (offset, &value) in self.layout.offsets().zip(data) {
            // SAFETY: offsets of a layout that fits the storage.
            unsafe { *base.add(offset) = value };
        }
        self.bump_version();
        Ok(())
    }

    /// Elements in logical row-major order.
    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        let base = self.base();
        self.layout.offsets().map(move |offset| {
            // SAFETY: offsets of a layout that fits the storage.
            unsafe { *base.add(offset) }
        })
    }

    /// Copy the elements out in logical row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.values().collect()
    }

    /// The value of a single-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(TensorError::NotScalar {
                numel: self.numel(),
            });
        }
        // SAFETY: the layout addresses exactly one element at its offset.
        Ok(unsafe { *self.base().add(self.layout.offset()) })
    }

    pub(crate) fn bump_version(&self) {
        self.storage.bump_version();
    }

    /// Alias of the same storage with gradients off and no producer.
    ///
    /// Writes through the result are visible to `self`; gradients never flow
    /// through it.
    pub fn detach(&self) -> Tensor {
        self.with_layout(self.layout)
    }

    pub fn requires_grad(&self) -> bool {
        self.autograd.requires_grad()
    }

    /// Enable or disable gradient tracking for ops that consume this tensor.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.autograd.set_requires_grad(requires_grad);
    }

    /// Accumulated gradient.
    ///
    /// After in-place ops this is the gradient with respect to the value the
    /// tensor held before them.
    pub fn grad(&self) -> Option<Tensor> {
        self.autograd.origin().get()
    }

    /// Replace the accumulated gradient.
    ///
    /// # Errors
    ///
    /// [`TensorError::ShapeMismatch`] or [`TensorError::DeviceMismatch`] when
    /// `grad` does not match `self`.
    pub fn set_grad(&self, grad: Option<Tensor>) -> Result<()> {
        if let Some(grad) = &grad {
            if grad.shape() != self.shape() {
                return Err(TensorError::ShapeMismatch {
                    lhs: SmallVec::from_slice(self.shape()),
                    rhs: SmallVec::from_slice(grad.shape()),
                });
            }
            if grad.device() != self.device() {
                return Err(TensorError::DeviceMismatch {
                    lhs: self.device(),
                    rhs: grad.device(),
                });
            }
        }
        self.autograd.origin().replace(grad);
        Ok(())
    }

    /// Drop the accumulated gradient.
    pub fn zero_grad(&self) {
        self.autograd.origin().replace(None);
    }

    /// Node that produced this tensor, if it was computed by a tracked op.
    pub fn grad_fn(&self) -> Option<Arc<Node>> {
        self.autograd.grad_fn()
    }

    /// True for tensors not produced by a tracked op.
    pub fn is_leaf(&self) -> bool {
        self.grad_fn().is_none()
    }

    /// Backpropagate from this tensor; see [`backward`](crate::autodiff::backward).
    pub fn backward(&self) -> Result<()> {
        backward(self)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(dtype={}, device={}, shape={:?}, strides={:?})",
            self.dtype,
            self.device(),
            self.shape(),
            self.strides()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zeroed() {
        let t = Tensor::empty(&[3, 2], Device::Cpu).unwrap();
        assert_eq!(t.to_vec(), vec![0.0; 6]);
        assert!(t.is_contiguous());
        assert!(t.is_leaf());
        assert!(!t.requires_grad());
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        let err = Tensor::from_vec(vec![1.0, 2.0], &[3], Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            TensorError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_get_set_bounds() {
        let t = Tensor::zeros(&[2, 2], Device::Cpu).unwrap();
        t.set(&[1, 0], 3.0).unwrap();
        assert_eq!(t.get(&[1, 0]).unwrap(), 3.0);
        assert!(matches!(
            t.get(&[2, 0]),
            Err(TensorError::IndexOutOfBounds { index: 2, dim_size: 2 })
        ));
        assert!(matches!(
            t.get(&[0]),
            Err(TensorError::WrongNumberOfIndices { .. })
        ));
    }

    #[test]
    fn test_shallow_clone_shares_everything() {
        let t = Tensor::ones(&[2], Device::Cpu).unwrap();
        let u = t.clone();
        u.set(&[0], 5.0).unwrap();
        assert_eq!(t.get(&[0]).unwrap(), 5.0);
        assert!(u.is_alias_of(&t));
        u.set_requires_grad(true);
        assert!(t.requires_grad());
        assert_eq!(t.storage().ref_count(), 2);
    }

    #[test]
    fn test_detach_aliases_without_grad() {
        let t = Tensor::ones(&[2], Device::Cpu).unwrap();
        t.set_requires_grad(true);
        let d = t.detach();
        assert!(d.is_alias_of(&t));
        assert!(!d.requires_grad());
        d.set(&[1], 9.0).unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 9.0]);
    }

    #[test]
    fn test_item_requires_single_element() {
        assert_eq!(Tensor::scalar(4.5, Device::Cpu).unwrap().item().unwrap(), 4.5);
        let t = Tensor::ones(&[2], Device::Cpu).unwrap();
        assert!(matches!(t.item(), Err(TensorError::NotScalar { numel: 2 })));
    }

    #[test]
    fn test_from_storage_checks_capacity() {
        let storage = Storage::allocate(16, Device::Cpu).unwrap();
        let layout = Layout::contiguous(&[5]).unwrap();
        assert!(matches!(
            Tensor::from_storage(storage.clone(), layout, DType::F32),
            Err(TensorError::OutOfBounds {
                required: 5,
                capacity: 4
            })
        ));
        let layout = Layout::contiguous(&[4]).unwrap();
        assert!(Tensor::from_storage(storage, layout, DType::F32).is_ok());
    }

    #[test]
    fn test_set_grad_checks_shape() {
        let t = Tensor::zeros(&[2, 2], Device::Cpu).unwrap();
        let bad = Tensor::zeros(&[4], Device::Cpu).unwrap();
        assert!(matches!(
            t.set_grad(Some(bad)),
            Err(TensorError::ShapeMismatch { .. })
        ));
        t.set_grad(Some(Tensor::ones(&[2, 2], Device::Cpu).unwrap()))
            .unwrap();
        assert_eq!(t.grad().unwrap().to_vec(), vec![1.0; 4]);
        t.zero_grad();
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_display() {
        let t = Tensor::zeros(&[2, 3], Device::Cpu).unwrap();
        assert_eq!(
            t.to_string(),
            "Tensor(dtype=f32, device=cpu, shape=[2, 3], strides=[3, 1])"
        );
    }

    #[test]
    fn test_from_slots() {
        let t = Tensor::from_slots(&[2, 3, 0, 0, 0, 0, 0, 0], Device::Cpu).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
    }
}
