//! Fixed-capacity shape/stride descriptor.
//!
//! A [`Layout`] holds up to [`MAX_RANK`] (extent, stride) pairs plus a base
//! offset, all in elements. Views, slices and transposes are pure rewrites of
//! this descriptor; they never touch storage.

use crate::error::{Result, TensorError};
use crate::strides::{self, Dims, MAX_RANK};
use smallvec::SmallVec;
use std::fmt;

/// Shape, strides and base offset of a tensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    rank: usize,
    extents: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    offset: usize,
}

impl Layout {
    /// Dense row-major layout for `dims` starting at offset 0.
    pub fn contiguous(dims: &[usize]) -> Result<Self> {
        let strides = strides::compute_strides(dims);
        Self::new(dims, &strides, 0)
    }

    /// Layout with explicit strides and offset.
    pub fn new(dims: &[usize], strides: &[usize], offset: usize) -> Result<Self> {
        if dims.len() > MAX_RANK {
            return Err(TensorError::RankOverflow { rank: dims.len() });
        }
        if dims.len() != strides.len() {
            return Err(TensorError::RankMismatch {
                expected: dims.len(),
                actual: strides.len(),
            });
        }
        if let Some(dim) = dims.iter().position(|&extent| extent == 0) {
            return Err(TensorError::InvalidExtent { dim });
        }
        if strides::numel(dims).is_none() || checked_span(dims, strides, offset).is_none() {
            return Err(TensorError::ShapeOverflow {
                dims: SmallVec::from_slice(dims),
            });
        }

        let mut layout = Self::scalar();
        layout.rank = dims.len();
        layout.extents[..dims.len()].copy_from_slice(dims);
        layout.strides[..dims.len()].copy_from_slice(strides);
        layout.offset = offset;
        Ok(layout)
    }

    /// Dense layout from an 8-slot extent array.
    ///
    /// Rank is the number of leading positive entries; everything from the
    /// first non-positive slot onwards is unused.
    ///
    /// ```
    /// use orchard_tensor::Layout;
    ///
    /// let layout = Layout::from_slots(&[2, 3, 0, 0, 0, 0, 0, 0]).unwrap();
    /// assert_eq!(layout.dims(), &[2, 3]);
    /// ```
    pub fn from_slots(slots: &[i64; MAX_RANK]) -> Result<Self> {
        let rank = slots.iter().take_while(|&&extent| extent > 0).count();
        let dims: Dims = slots[..rank].iter().map(|&extent| extent as usize).collect();
        Self::contiguous(&dims)
    }

    /// Rank-0 layout addressing a single element.
    pub fn scalar() -> Self {
        Self {
            rank: 0,
            extents: [0; MAX_RANK],
            strides: [0; MAX_RANK],
            offset: 0,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.extents[..self.rank]
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.rank]
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of addressed elements.
    #[inline]
    pub fn numel(&self) -> usize {
        // bounded by the check in `new`
        self.dims().iter().product()
    }

    /// True when strides are the dense row-major strides of the extents.
    pub fn is_contiguous(&self) -> bool {
        let expected = strides::compute_strides(self.dims());
        self.dims()
            .iter()
            .zip(self.strides().iter().zip(expected.iter()))
            .all(|(&extent, (&stride, &dense))| extent == 1 || stride == dense)
    }

    /// Element offset of the logical row-major index `linear`.
    pub fn offset_of(&self, linear: usize) -> usize {
        let coords = strides::linear_to_cartesian(linear, self.dims());
        self.offset + strides::cartesian_to_linear(&coords, self.strides())
    }

    /// Element offset of a multi-index, bounds checked.
    pub fn offset_at(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank {
            return Err(TensorError::WrongNumberOfIndices {
                expected: self.rank,
                actual: index.len(),
            });
        }
        for (&idx, &extent) in index.iter().zip(self.dims()) {
            if idx >= extent {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    dim_size: extent,
                });
            }
        }
        Ok(self.offset + strides::cartesian_to_linear(index, self.strides()))
    }

    /// Elements of storage needed to back this layout.
    pub fn span(&self) -> usize {
        checked_span(self.dims(), self.strides(), self.offset).unwrap_or(usize::MAX)
    }

    /// Reinterpret a dense layout with new extents of equal element count.
    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        let target = Self::contiguous(dims)?;
        if target.numel() != self.numel() {
            return Err(TensorError::ShapeMismatch {
                lhs: SmallVec::from_slice(self.dims()),
                rhs: SmallVec::from_slice(dims),
            });
        }
        if !self.is_contiguous() {
            return Err(TensorError::NonContiguous);
        }
        Ok(Self {
            offset: self.offset,
            ..target
        })
    }

    /// Restrict axis `dim` to `start..end` taking every `step`-th element.
    pub fn slice(&self, dim: usize, start: usize, end: usize, step: usize) -> Result<Self> {
        self.check_dim(dim)?;
        let size = self.extents[dim];
        if step == 0 || start >= end || end > size {
            return Err(TensorError::InvalidSlice {
                dim,
                start,
                end,
                step,
                size,
            });
        }
        let mut out = *self;
        out.extents[dim] = (end - start).div_ceil(step);
        if out.extents[dim] > 1 {
            out.strides[dim] = self.strides[dim] * step;
        }
        out.offset = self.offset + start * self.strides[dim];
        Ok(out)
    }

    /// Swap two axes.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;
        let mut out = *self;
        out.extents.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    /// Insert an axis of extent 1 before position `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.rank {
            return Err(TensorError::DimOutOfRange {
                dim,
                rank: self.rank,
            });
        }
        let mut dims: Dims = SmallVec::from_slice(self.dims());
        let mut strides: Dims = SmallVec::from_slice(self.strides());
        let stride = if dim < self.rank {
            self.strides[dim].saturating_mul(self.extents[dim])
        } else {
            1
        };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        Self::new(&dims, &strides, self.offset)
    }

    /// Drop an axis of extent 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        self.check_dim(dim)?;
        if self.extents[dim] != 1 {
            return Err(TensorError::ShapeMismatch {
                lhs: SmallVec::from_slice(self.dims()),
                rhs: SmallVec::from_slice(&[1]),
            });
        }
        let mut dims: Dims = SmallVec::from_slice(self.dims());
        let mut strides: Dims = SmallVec::from_slice(self.strides());
        dims.remove(dim);
        strides.remove(dim);
        Self::new(&dims, &strides, self.offset)
    }

    /// Stretch to `target` extents, aligning trailing axes.
    ///
    /// Axes of extent 1 and missing leading axes get stride 0.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Self> {
        let mismatch = || TensorError::ShapeMismatch {
            lhs: SmallVec::from_slice(self.dims()),
            rhs: SmallVec::from_slice(target),
        };
        if target.len() < self.rank {
            return Err(mismatch());
        }
        let lead = target.len() - self.rank;
        let mut strides: Dims = SmallVec::from_elem(0, target.len());
        for (axis, &extent) in target.iter().enumerate().skip(lead) {
            let source = axis - lead;
            let own = self.extents[source];
            strides[axis] = if own == extent && extent != 1 {
                self.strides[source]
            } else if own == 1 {
                0
            } else {
                return Err(mismatch());
            };
        }
        Self::new(target, &strides, self.offset)
    }

    /// Element offsets in logical row-major order.
    pub fn offsets(&self) -> Offsets {
        Offsets::new(*self)
    }

    /// `#[repr(C)]` form handed to kernels.
    pub fn packed(&self) -> PackedLayout {
        let mut packed = PackedLayout {
            rank: self.rank as u32,
            extents: [0; MAX_RANK],
            strides: [0; MAX_RANK],
            offset: self.offset as i64,
        };
        for axis in 0..self.rank {
            packed.extents[axis] = self.extents[axis] as i64;
            packed.strides[axis] = self.strides[axis] as i64;
        }
        packed
    }

    /// Rebuild from a packed descriptor, rejecting malformed input.
    pub fn from_packed(packed: &PackedLayout) -> Option<Self> {
        let rank = packed.rank as usize;
        if rank > MAX_RANK || packed.offset < 0 {
            return None;
        }
        let mut dims: Dims = SmallVec::new();
        let mut strides: Dims = SmallVec::new();
        for axis in 0..rank {
            if packed.extents[axis] <= 0 || packed.strides[axis] < 0 {
                return None;
            }
            dims.push(packed.extents[axis] as usize);
            strides.push(packed.strides[axis] as usize);
        }
        Self::new(&dims, &strides, packed.offset as usize).ok()
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.rank {
            return Err(TensorError::DimOutOfRange {
                dim,
                rank: self.rank,
            });
        }
        Ok(())
    }
}

/// One past the furthest element offset, or `None` on overflow.
fn checked_span(dims: &[usize], strides: &[usize], offset: usize) -> Option<usize> {
    dims.iter()
        .zip(strides)
        .try_fold(offset, |end, (&extent, &stride)| {
            end.checked_add((extent - 1).checked_mul(stride)?)
        })?
        .checked_add(1)
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("dims", &self.dims())
            .field("strides", &self.strides())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Packed shape/stride description passed across the kernel boundary.
///
/// Slots at and beyond `rank` hold zero extents.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub rank: u32,
    pub extents: [i64; MAX_RANK],
    pub strides: [i64; MAX_RANK],
    pub offset: i64,
}

/// Odometer over the element offsets of a layout.
#[derive(Debug, Clone)]
pub struct Offsets {
    layout: Layout,
    index: [usize; MAX_RANK],
    current: usize,
    remaining: usize,
}

impl Offsets {
    fn new(layout: Layout) -> Self {
        Self {
            index: [0; MAX_RANK],
            current: layout.offset,
            remaining: layout.numel(),
            layout,
        }
    }
}

impl Iterator for Offsets {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let value = self.current;
        self.remaining -= 1;
        if self.remaining > 0 {
            for axis in (0..self.layout.rank).rev() {
                self.index[axis] += 1;
                // may step past the span on the carry; the subtraction undoes it
                self.current = self.current.wrapping_add(self.layout.strides[axis]);
                if self.index[axis] < self.layout.extents[axis] {
                    break;
                }
                self.current = self
                    .current
                    .wrapping_sub(self.layout.strides[axis].wrapping_mul(self.layout.extents[axis]));
                self.index[axis] = 0;
            }
        }
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets {}
