//! Stride computation utilities.
//!
//! Uses row-major (C) order: the trailing axis is the fastest varying one.
//! Strides and offsets are counted in elements, not bytes.

use smallvec::SmallVec;

/// Maximum number of axes a tensor can have.
pub const MAX_RANK: usize = 8;

/// Inline extent/stride list; never spills for valid tensors.
pub type Dims = SmallVec<[usize; MAX_RANK]>;

/// Compute row-major strides from shape.
///
/// For shape [d0, d1, d2], returns strides [d1*d2, d2, 1]. Strides
/// saturate at `usize::MAX`; [`numel`] reports shapes too large to address.
///
/// # Examples
///
/// ```
/// use orchard_tensor::strides::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]).as_slice(), &[20, 5, 1]);
/// assert_eq!(compute_strides(&[2, 3]).as_slice(), &[3, 1]);
/// assert!(compute_strides(&[]).is_empty());
/// ```
pub fn compute_strides(shape: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(0, shape.len());
    let mut stride = 1;
    for (slot, &dim) in strides.iter_mut().zip(shape).rev() {
        *slot = stride;
        stride = stride.saturating_mul(dim);
    }
    strides
}

/// Convert cartesian indices to an element offset (excluding base offset).
#[inline]
pub fn cartesian_to_linear(indices: &[usize], strides: &[usize]) -> usize {
    indices
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Decompose a logical row-major index into per-axis coordinates.
///
/// Peels the trailing axis first with divide/modulo.
pub fn linear_to_cartesian(mut linear: usize, shape: &[usize]) -> Dims {
    let mut indices: Dims = SmallVec::from_elem(0, shape.len());
    for (slot, &dim) in indices.iter_mut().zip(shape).rev() {
        *slot = linear % dim;
        linear /= dim;
    }
    indices
}

/// Number of elements of a shape; 1 for rank 0.
///
/// `None` when the count does not fit in `usize`.
#[inline]
pub fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}
