//! Tracked elementwise arithmetic with backward passes.

use crate::autodiff::graph::{GradFn, Node, record};
use crate::autodiff::saved_tensor::SavedTensor;
use crate::backend::KernelOp;
use crate::error::{Result, TensorError};
use crate::operations::compute::{self, sum_to};
use crate::strides::Dims;
use crate::tensor::Tensor;
use smallvec::SmallVec;
use std::sync::Arc;

/// Backward function for broadcasting addition.
#[derive(Debug)]
pub(crate) struct AddBackward {
    lhs_shape: Dims,
    rhs_shape: Dims,
}

impl GradFn for AddBackward {
    fn name(&self) -> &'static str {
        "AddBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(sum_to(grad_output, &self.lhs_shape)?),
            Some(sum_to(grad_output, &self.rhs_shape)?),
        ])
    }
}

/// Backward function for broadcasting multiplication.
///
/// d(a*b)/da = b, d(a*b)/db = a.
#[derive(Debug)]
pub(crate) struct MulBackward {
    lhs: SavedTensor,
    rhs: SavedTensor,
}

impl GradFn for MulBackward {
    fn name(&self) -> &'static str {
        "MulBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let a = self.lhs.value(self.name())?;
        let b = self.rhs.value(self.name())?;
        let grad_a = compute::binary(KernelOp::Mul, grad_output, b)?;
        let grad_b = compute::binary(KernelOp::Mul, grad_output, a)?;
        Ok(vec![
            Some(sum_to(&grad_a, a.shape())?),
            Some(sum_to(&grad_b, b.shape())?),
        ])
    }
}

/// Backward function for broadcasting division.
///
/// d(a/b)/da = 1/b, d(a/b)/db = -a/b². In safe mode positions where `b` is
/// zero get a zero gradient; otherwise the forward pass already rejected them.
#[derive(Debug)]
pub(crate) struct DivBackward {
    lhs: SavedTensor,
    rhs: SavedTensor,
    safe: bool,
}

impl GradFn for DivBackward {
    fn name(&self) -> &'static str {
        "DivBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let a = self.lhs.value(self.name())?;
        let b = self.rhs.value(self.name())?;
        let div = KernelOp::Div { safe: self.safe };
        let grad_a = compute::binary(div, grad_output, b)?;
        let scaled = compute::binary(KernelOp::Mul, grad_output, a)?;
        let quotient = compute::binary(div, &compute::binary(div, &scaled, b)?, b)?;
        let grad_b = compute::mul_scalar(&quotient, -1.0)?;
        Ok(vec![
            Some(sum_to(&grad_a, a.shape())?),
            Some(sum_to(&grad_b, b.shape())?),
        ])
    }
}

#[derive(Debug)]
pub(crate) struct AddScalarBackward;

impl GradFn for AddScalarBackward {
    fn name(&self) -> &'static str {
        "AddScalarBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone())])
    }
}

#[derive(Debug)]
pub(crate) struct MulScalarBackward {
    scalar: f32,
}

impl GradFn for MulScalarBackward {
    fn name(&self) -> &'static str {
        "MulScalarBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(compute::mul_scalar(grad_output, self.scalar)?)])
    }
}

/// Backward function for division by a constant, out of place or in place.
///
/// The in-place form keeps a copy of the value from before the write, so
/// the node stays valid however often the shared storage is divided again.
#[derive(Debug)]
pub(crate) struct DivScalarBackward {
    scalar: f32,
    safe: bool,
    input: DivScalarInput,
}

#[derive(Debug)]
enum DivScalarInput {
    /// Out of place: only the input shape is needed.
    Shape(Dims),
    /// In place: the value before the write.
    Snapshot(SavedTensor),
}

impl GradFn for DivScalarBackward {
    fn name(&self) -> &'static str {
        "DivScalarBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let shape = match &self.input {
            DivScalarInput::Shape(shape) => shape.as_slice(),
            DivScalarInput::Snapshot(before) => before.value(self.name())?.shape(),
        };
        if grad_output.shape() != shape {
            return Err(TensorError::ShapeMismatch {
                lhs: SmallVec::from_slice(shape),
                rhs: SmallVec::from_slice(grad_output.shape()),
            });
        }
        Ok(vec![Some(compute::div_scalar(grad_output, self.scalar, self.safe)?)])
    }
}

impl Tensor {
    /// Elementwise sum with broadcasting.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3], Device::Cpu).unwrap();
    /// let b = Tensor::from_vec(vec![10.0, 20.0], &[2, 1], Device::Cpu).unwrap();
    /// let c = a.add(&b).unwrap();
    /// assert_eq!(c.shape(), &[2, 3]);
    /// assert_eq!(c.to_vec(), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let out = compute::binary(KernelOp::Add, self, other)?;
        record(out, &[self, other], || {
            Ok(Box::new(AddBackward {
                lhs_shape: SmallVec::from_slice(self.shape()),
                rhs_shape: SmallVec::from_slice(other.shape()),
            }))
        })
    }

    /// Elementwise product with broadcasting.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let out = compute::binary(KernelOp::Mul, self, other)?;
        record(out, &[self, other], || {
            Ok(Box::new(MulBackward {
                lhs: SavedTensor::new(self),
                rhs: SavedTensor::new(other),
            }))
        })
    }

    /// Elementwise quotient with broadcasting.
    ///
    /// With `safe`, zero divisors give 0 (and a zero gradient). Without it
    /// any zero divisor fails with [`TensorError::DivideByZero`] before
    /// anything is computed.
    pub fn div(&self, other: &Tensor, safe: bool) -> Result<Tensor> {
        let out = compute::binary(KernelOp::Div { safe }, self, other)?;
        record(out, &[self, other], || {
            Ok(Box::new(DivBackward {
                lhs: SavedTensor::new(self),
                rhs: SavedTensor::new(other),
                safe,
            }))
        })
    }

    pub fn add_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = compute::add_scalar(self, scalar)?;
        record(out, &[self], || Ok(Box::new(AddScalarBackward)))
    }

    pub fn mul_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = compute::mul_scalar(self, scalar)?;
        record(out, &[self], || Ok(Box::new(MulScalarBackward { scalar })))
    }

    /// Divide by a constant; `safe` maps a zero divisor to a zero result.
    pub fn div_scalar(&self, scalar: f32, safe: bool) -> Result<Tensor> {
        let out = compute::div_scalar(self, scalar, safe)?;
        record(out, &[self], || {
            Ok(Box::new(DivScalarBackward {
                scalar,
                safe,
                input: DivScalarInput::Shape(SmallVec::from_slice(self.shape())),
            }))
        })
    }

    /// Divide by a constant in place.
    ///
    /// The write is visible through every alias. When gradients are enabled
    /// the pre-division value is snapshotted first and the new producer
    /// differentiates against it, so repeated in-place divisions chain
    /// correctly. Values other ops saved from this storage become invalid
    /// for their backward pass.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let t = Tensor::from_vec(vec![2.0, 4.0], &[2], Device::Cpu).unwrap();
    /// t.set_requires_grad(true);
    /// t.div_(2.0, false).unwrap();
    /// t.div_(4.0, false).unwrap();
    /// t.sum().unwrap().backward().unwrap();
    /// assert_eq!(t.to_vec(), vec![0.25, 0.5]);
    /// assert_eq!(t.grad().unwrap().to_vec(), vec![0.125, 0.125]);
    /// ```
    pub fn div_(&self, scalar: f32, safe: bool) -> Result<()> {
        if !safe && scalar == 0.0 {
            return Err(TensorError::DivideByZero);
        }
        let node = if self.requires_grad() {
            let before = SavedTensor::owned(compute::materialize(self)?);
            let grad_fn = DivScalarBackward {
                scalar,
                safe,
                input: DivScalarInput::Snapshot(before),
            };
            Some(Arc::new(Node::new(Box::new(grad_fn), vec![Some(self.autograd.edge())])))
        } else {
            None
        };
        compute::div_scalar_in_place(self, scalar, safe)?;
        self.bump_version();
        if let Some(node) = node {
            self.autograd.rebase(node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::Device;
    use crate::error::TensorError;
    use crate::tensor::Tensor;

    fn leaf(data: &[f32], shape: &[usize]) -> Tensor {
        let t = Tensor::from_slice(data, shape, Device::Cpu).unwrap();
        t.set_requires_grad(true);
        t
    }

    #[test]
    fn test_add_broadcast_gradient() {
        let a = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = leaf(&[1.0, 1.0, 1.0], &[3]);
        let out = a.add(&b).unwrap();
        assert_eq!(out.grad_fn().unwrap().name(), "AddBackward");
        out.sum().unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0; 6]);
        assert_eq!(b.grad().unwrap().shape(), &[3]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_mul_gradient() {
        let a = leaf(&[1.0, 2.0], &[2]);
        let b = leaf(&[3.0, 4.0], &[2]);
        a.mul(&b).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![3.0, 4.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_safe_div_zero_gradient() {
        let a = leaf(&[1.0, 2.0], &[2]);
        let b = leaf(&[0.0, 4.0], &[2]);
        let out = a.div(&b, true).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 0.5]);
        out.sum().unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![0.0, 0.25]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![0.0, -0.125]);
    }

    #[test]
    fn test_unsafe_div_fails_without_recording() {
        let a = leaf(&[1.0, 2.0], &[2]);
        let b = Tensor::from_slice(&[0.0, 4.0], &[2], Device::Cpu).unwrap();
        assert!(matches!(a.div(&b, false), Err(TensorError::DivideByZero)));
        assert!(matches!(a.div_scalar(0.0, false), Err(TensorError::DivideByZero)));
        assert!(matches!(a.div_(0.0, false), Err(TensorError::DivideByZero)));
        assert_eq!(a.to_vec(), vec![1.0, 2.0]);
        assert!(a.is_leaf());
    }

    #[test]
    fn test_scalar_forms() {
        let a = leaf(&[1.0, 2.0], &[2]);
        let out = a.add_scalar(1.0).unwrap().mul_scalar(3.0).unwrap();
        assert_eq!(out.to_vec(), vec![6.0, 9.0]);
        let out = out.div_scalar(0.0, true).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 0.0]);
        out.sum().unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_in_place_div_without_grad_mutates_aliases() {
        let t = Tensor::from_slice(&[2.0, 4.0, 6.0, 8.0], &[2, 2], Device::Cpu).unwrap();
        let column = t.slice(1, 1, 2, 1).unwrap();
        column.div_(2.0, false).unwrap();
        assert_eq!(t.to_vec(), vec![2.0, 2.0, 6.0, 4.0]);
        assert!(column.is_leaf());
    }

    #[test]
    fn test_in_place_div_checks_gradient_against_snapshot_shape() {
        let t = leaf(&[2.0, 4.0, 6.0, 8.0], &[2, 2]);
        let column = t.mul_scalar(1.0).unwrap().slice(1, 1, 2, 1).unwrap();
        column.div_(2.0, false).unwrap();
        let node = column.grad_fn().unwrap();
        assert_eq!(node.name(), "DivScalarBackward");

        let wrong = Tensor::ones(&[2], Device::Cpu).unwrap();
        match node.apply(&wrong) {
            Err(TensorError::ShapeMismatch { lhs, rhs }) => {
                assert_eq!(lhs.as_slice(), &[2, 1]);
                assert_eq!(rhs.as_slice(), &[2]);
            }
            other => panic!("expected a shape mismatch, got {other:?}"),
        }

        let grads = node.apply(&Tensor::ones(&[2, 1], Device::Cpu).unwrap()).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().to_vec(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_in_place_div_invalidates_saved_operands() {
        let a = leaf(&[1.0, 2.0], &[2]);
        let b = Tensor::from_slice(&[3.0, 4.0], &[2], Device::Cpu).unwrap();
        let out = a.mul(&b).unwrap();
        b.div_(2.0, false).unwrap();
        assert!(matches!(
            out.sum().unwrap().backward(),
            Err(TensorError::SavedTensorModified { op: "MulBackward" })
        ));
        assert!(a.grad().is_none());
    }
}
