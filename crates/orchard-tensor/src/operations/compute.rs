//! Untracked kernels behind the public ops.
//!
//! Each helper allocates its output (or writes into the one it is given),
//! builds a [`Launch`] from the operands' layouts and hands it to the
//! dispatcher. Nothing here records autograd nodes, so backward functions
//! use these helpers directly.

use crate::backend::{KernelInput, KernelOp, KernelOutput, Launch, dispatch};
use crate::broadcast::{self, reduction_axes};
use crate::device::Device;
use crate::error::{Result, TensorError};
use crate::layout::Layout;
use crate::tensor::Tensor;
use smallvec::SmallVec;

/// Run `op` writing `out`, with each input addressed through the paired layout.
///
/// Every layout must be derived from its tensor's own layout, so that it
/// stays within that tensor's storage.
fn launch(out: &Tensor, op: KernelOp, inputs: &[(&Tensor, Layout)]) -> Result<()> {
    let inputs: SmallVec<[KernelInput; 2]> = inputs
        .iter()
        .map(|(tensor, layout)| KernelInput {
            ptr: tensor.storage().as_ptr().cast_const().cast(),
            layout: layout.packed(),
        })
        .collect();
    let launch = Launch {
        inputs: &inputs,
        output: KernelOutput {
            ptr: out.storage().as_ptr().cast(),
            layout: out.layout().packed(),
        },
        numel: out.numel(),
    };
    // SAFETY: each layout addresses only within its tensor's storage (checked
    // at construction, preserved by every layout transform), and the handles
    // keep the storages alive for the duration of the call.
    unsafe { dispatch(out.device(), &op, &launch) }
}

fn same_device(lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.device() != rhs.device() {
        return Err(TensorError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }
    Ok(())
}

fn shape_mismatch(lhs: &[usize], rhs: &[usize]) -> TensorError {
    TensorError::ShapeMismatch {
        lhs: SmallVec::from_slice(lhs),
        rhs: SmallVec::from_slice(rhs),
    }
}

/// Broadcasting `Add`, `Mul` or `Div` into a fresh tensor.
///
/// An unsafe divide scans the divisor first and fails before allocating.
pub(crate) fn binary(op: KernelOp, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    same_device(lhs, rhs)?;
    let plan = broadcast::resolve(lhs.layout(), rhs.layout())?;
    if matches!(op, KernelOp::Div { safe: false }) && rhs.values().any(|v| v == 0.0) {
        return Err(TensorError::DivideByZero);
    }
    let out = Tensor::empty(plan.output.dims(), lhs.device())?;
    launch(&out, op, &[(lhs, plan.lhs), (rhs, plan.rhs)])?;
    Ok(out)
}

/// `lhs + rhs` for gradients of identical shape.
pub(crate) fn accumulate(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    if lhs.shape() != rhs.shape() {
        return Err(shape_mismatch(lhs.shape(), rhs.shape()));
    }
    binary(KernelOp::Add, lhs, rhs)
}

pub(crate) fn add_scalar(tensor: &Tensor, scalar: f32) -> Result<Tensor> {
    binary(KernelOp::Add, tensor, &Tensor::scalar(scalar, tensor.device())?)
}

pub(crate) fn mul_scalar(tensor: &Tensor, scalar: f32) -> Result<Tensor> {
    binary(KernelOp::Mul, tensor, &Tensor::scalar(scalar, tensor.device())?)
}

pub(crate) fn div_scalar(tensor: &Tensor, scalar: f32, safe: bool) -> Result<Tensor> {
    if !safe && scalar == 0.0 {
        return Err(TensorError::DivideByZero);
    }
    let out = Tensor::empty(tensor.shape(), tensor.device())?;
    launch(&out, KernelOp::DivScalar { scalar, safe }, &[(tensor, *tensor.layout())])?;
    Ok(out)
}

/// Divide the addressed elements of `tensor` in place.
pub(crate) fn div_scalar_in_place(tensor: &Tensor, scalar: f32, safe: bool) -> Result<()> {
    if !safe && scalar == 0.0 {
        return Err(TensorError::DivideByZero);
    }
    launch(tensor, KernelOp::DivScalar { scalar, safe }, &[(tensor, *tensor.layout())])
}

pub(crate) fn fill(tensor: &Tensor, value: f32) -> Result<()> {
    launch(tensor, KernelOp::Fill { value }, &[])
}

/// Sum or mean of every element, as a rank-0 tensor.
pub(crate) fn reduce_all(tensor: &Tensor, mean: bool) -> Result<Tensor> {
    let op = if mean { KernelOp::Mean } else { KernelOp::Sum };
    let out = Tensor::empty(&[], tensor.device())?;
    launch(&out, op, &[(tensor, *tensor.layout())])?;
    Ok(out)
}

/// Sum or mean over `axis`.
pub(crate) fn reduce_axis(tensor: &Tensor, axis: usize, keepdim: bool, mean: bool) -> Result<Tensor> {
    if axis >= tensor.ndim() {
        return Err(TensorError::DimOutOfRange {
            dim: axis,
            rank: tensor.ndim(),
        });
    }
    let op = if mean {
        KernelOp::MeanAxis { axis }
    } else {
        KernelOp::SumAxis { axis }
    };
    let mut shape: SmallVec<[usize; 8]> = SmallVec::from_slice(tensor.shape());
    shape[axis] = 1;
    let out = Tensor::empty(&shape, tensor.device())?;
    launch(&out, op, &[(tensor, *tensor.layout())])?;
    if keepdim {
        Ok(out)
    } else {
        Ok(out.with_layout(out.layout().squeeze(axis)?))
    }
}

/// `(m x k) @ (k x n)`.
pub(crate) fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    for operand in [lhs, rhs] {
        if operand.ndim() != 2 {
            return Err(TensorError::RankMismatch {
                expected: 2,
                actual: operand.ndim(),
            });
        }
    }
    if lhs.shape()[1] != rhs.shape()[0] {
        return Err(shape_mismatch(lhs.shape(), rhs.shape()));
    }
    same_device(lhs, rhs)?;
    let out = Tensor::empty(&[lhs.shape()[0], rhs.shape()[1]], lhs.device())?;
    launch(&out, KernelOp::Matmul, &[(lhs, *lhs.layout()), (rhs, *rhs.layout())])?;
    Ok(out)
}

/// Untracked view with axes `dim0` and `dim1` swapped.
pub(crate) fn transposed(tensor: &Tensor, dim0: usize, dim1: usize) -> Result<Tensor> {
    Ok(tensor.with_layout(tensor.layout().transpose(dim0, dim1)?))
}

/// Dense copy of `tensor` in fresh storage on `device`.
pub(crate) fn copy_to(tensor: &Tensor, device: Device) -> Result<Tensor> {
    let out = Tensor::empty(tensor.shape(), device)?;
    launch(&out, KernelOp::Copy, &[(tensor, *tensor.layout())])?;
    Ok(out)
}

/// Dense copy of `tensor` in fresh storage on its own device.
pub(crate) fn materialize(tensor: &Tensor) -> Result<Tensor> {
    copy_to(tensor, tensor.device())
}

/// Copy `src`, broadcast to the shape of `dst`, into the elements `dst` addresses.
pub(crate) fn copy_into(dst: &Tensor, src: &Tensor) -> Result<()> {
    let layout = src.layout().broadcast_to(dst.shape())?;
    launch(dst, KernelOp::Copy, &[(src, layout)])
}

/// Dense copy of `tensor` broadcast to `shape`.
pub(crate) fn expand(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let layout = tensor.layout().broadcast_to(shape)?;
    let out = Tensor::empty(shape, tensor.device())?;
    launch(&out, KernelOp::Copy, &[(tensor, layout)])?;
    Ok(out)
}

/// Untracked reshape, copying first when `tensor` is not dense.
pub(crate) fn reshape(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let dense = if tensor.is_contiguous() {
        tensor.clone()
    } else {
        materialize(tensor)?
    };
    Ok(dense.with_layout(dense.layout().reshape(shape)?))
}

/// Sum a broadcast gradient back down to `shape`.
pub(crate) fn sum_to(grad: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if grad.shape() == shape {
        return Ok(grad.clone());
    }
    let mut reduced = grad.clone();
    for axis in reduction_axes(grad.shape(), shape) {
        reduced = reduce_axis(&reduced, axis, true, false)?;
    }
    reshape(&reduced, shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_slice(data, shape, Device::Cpu).unwrap()
    }

    #[test]
    fn test_binary_broadcast_and_device_check() {
        let a = tensor(&[1.0, 2.0, 3.0], &[3]);
        let b = tensor(&[10.0, 20.0], &[2, 1]);
        let out = binary(KernelOp::Add, &a, &b).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.to_vec(), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);

        let c = Tensor::ones(&[3], Device::Accelerator).unwrap();
        assert!(matches!(
            binary(KernelOp::Add, &a, &c),
            Err(TensorError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_unsafe_div_checks_before_writing() {
        let a = tensor(&[1.0, 2.0], &[2]);
        let b = tensor(&[1.0, 0.0], &[2]);
        assert!(matches!(
            binary(KernelOp::Div { safe: false }, &a, &b),
            Err(TensorError::DivideByZero)
        ));
        let out = binary(KernelOp::Div { safe: true }, &a, &b).unwrap();
        assert_eq!(out.to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_reduce_axis_keepdim() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let kept = reduce_axis(&t, 0, true, false).unwrap();
        assert_eq!(kept.shape(), &[1, 3]);
        assert_eq!(kept.to_vec(), vec![5.0, 7.0, 9.0]);
        let dropped = reduce_axis(&t, 1, false, true).unwrap();
        assert_eq!(dropped.shape(), &[2]);
        assert_eq!(dropped.to_vec(), vec![2.0, 5.0]);
        assert!(reduce_axis(&t, 2, false, false).is_err());
    }

    #[test]
    fn test_sum_to_collapses_broadcast_axes() {
        let g = Tensor::ones(&[2, 3, 4], Device::Cpu).unwrap();
        let reduced = sum_to(&g, &[3, 1]).unwrap();
        assert_eq!(reduced.shape(), &[3, 1]);
        assert_eq!(reduced.to_vec(), vec![8.0; 3]);
        let scalar = sum_to(&g, &[]).unwrap();
        assert_eq!(scalar.item().unwrap(), 24.0);
    }

    #[test]
    fn test_copy_into_strided_destination() {
        let dst = Tensor::zeros(&[2, 4], Device::Cpu).unwrap();
        let view = dst.with_layout(dst.layout().slice(1, 1, 4, 2).unwrap());
        copy_into(&view, &tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2])).unwrap();
        assert_eq!(dst.to_vec(), vec![0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_matmul_rank_and_inner_dim() {
        let a = tensor(&[1.0, 2.0, 3.0], &[3]);
        let b = tensor(&[1.0, 2.0], &[1, 2]);
        assert!(matches!(
            matmul(&a, &b),
            Err(TensorError::RankMismatch { expected: 2, actual: 1 })
        ));
        let a = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert!(matches!(matmul(&a, &b), Err(TensorError::ShapeMismatch { .. })));
    }
}
