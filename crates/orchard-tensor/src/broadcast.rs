//! Broadcasting resolver.
//!
//! Shapes are compared trailing axis inward. Equal extents are kept; an
//! extent of 1 (or a missing leading axis) stretches to the other side with
//! an effective stride of 0; anything else is a [`TensorError::ShapeMismatch`].

use crate::error::{Result, TensorError};
use crate::layout::Layout;
use crate::strides::{Dims, MAX_RANK};
use smallvec::SmallVec;

/// Result of resolving two operands against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Broadcast {
    /// Dense output layout of the broadcast shape.
    pub output: Layout,
    /// Left operand addressed over the output extents.
    pub lhs: Layout,
    /// Right operand addressed over the output extents.
    pub rhs: Layout,
}

/// Broadcast shape of two shapes.
///
/// ```
/// use orchard_tensor::broadcast::broadcast_shapes;
///
/// let shape = broadcast_shapes(&[2, 1, 3], &[4, 1]).unwrap();
/// assert_eq!(shape.as_slice(), &[2, 4, 3]);
/// ```
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Dims> {
    let rank = lhs.len().max(rhs.len());
    if rank > MAX_RANK {
        return Err(TensorError::RankOverflow { rank });
    }
    let mut out: Dims = SmallVec::from_elem(1, rank);
    for axis in 0..rank {
        let a = extent_from_back(lhs, axis);
        let b = extent_from_back(rhs, axis);
        out[rank - 1 - axis] = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(TensorError::ShapeMismatch {
                    lhs: SmallVec::from_slice(lhs),
                    rhs: SmallVec::from_slice(rhs),
                });
            }
        };
    }
    Ok(out)
}

/// Resolve two layouts into effective per-operand layouts over the
/// broadcast shape.
pub fn resolve(lhs: &Layout, rhs: &Layout) -> Result<Broadcast> {
    let dims = broadcast_shapes(lhs.dims(), rhs.dims())?;
    Ok(Broadcast {
        output: Layout::contiguous(&dims)?,
        lhs: lhs.broadcast_to(&dims)?,
        rhs: rhs.broadcast_to(&dims)?,
    })
}

/// Axes of `from` that must be summed (keeping them) to collapse it onto `to`.
///
/// `to` must broadcast to `from`. Leading axes missing from `to` and axes
/// where `to` has extent 1 are reported.
pub fn reduction_axes(from: &[usize], to: &[usize]) -> Dims {
    let lead = from.len().saturating_sub(to.len());
    from.iter()
        .enumerate()
        .filter(|&(axis, &extent)| axis < lead || (to[axis - lead] == 1 && extent != 1))
        .map(|(axis, _)| axis)
        .collect()
}

fn extent_from_back(dims: &[usize], axis: usize) -> usize {
    if axis < dims.len() {
        dims[dims.len() - 1 - axis]
    } else {
        1
    }
}
