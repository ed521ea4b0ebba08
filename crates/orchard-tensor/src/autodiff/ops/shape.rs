//! Tracked views, copies and device transfer.
//!
//! Views share storage with their input and only rewrite the layout. Copies
//! (`contiguous` of a strided tensor, `deep_clone`, `to`) allocate fresh
//! storage. All of them pass gradients straight through, reshaped to the
//! input.

use crate::autodiff::graph::{GradFn, record};
use crate::device::Device;
use crate::error::Result;
use crate::operations::compute;
use crate::strides::Dims;
use crate::tensor::Tensor;
use smallvec::SmallVec;

#[derive(Debug)]
pub(crate) struct ViewBackward {
    input_shape: Dims,
}

impl GradFn for ViewBackward {
    fn name(&self) -> &'static str {
        "ViewBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(compute::reshape(grad_output, &self.input_shape)?)])
    }
}

/// Backward function for slicing: scatter the gradient into zeros.
#[derive(Debug)]
pub(crate) struct SliceBackward {
    input_shape: Dims,
    dim: usize,
    start: usize,
    end: usize,
    step: usize,
}

impl GradFn for SliceBackward {
    fn name(&self) -> &'static str {
        "SliceBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = Tensor::zeros(&self.input_shape, grad_output.device())?;
        let window = grad.layout().slice(self.dim, self.start, self.end, self.step)?;
        compute::copy_into(&grad.with_layout(window), grad_output)?;
        Ok(vec![Some(grad)])
    }
}

#[derive(Debug)]
pub(crate) struct TransposeBackward {
    dim0: usize,
    dim1: usize,
}

impl GradFn for TransposeBackward {
    fn name(&self) -> &'static str {
        "TransposeBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let swapped = compute::transposed(grad_output, self.dim0, self.dim1)?;
        Ok(vec![Some(compute::materialize(&swapped)?)])
    }
}

#[derive(Debug)]
pub(crate) struct UnsqueezeBackward {
    dim: usize,
}

impl GradFn for UnsqueezeBackward {
    fn name(&self) -> &'static str {
        "UnsqueezeBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let squeezed = grad_output.layout().squeeze(self.dim)?;
        Ok(vec![Some(grad_output.with_layout(squeezed))])
    }
}

/// Backward function for copies on the same device.
#[derive(Debug)]
pub(crate) struct CloneBackward;

impl GradFn for CloneBackward {
    fn name(&self) -> &'static str {
        "CloneBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone())])
    }
}

/// Backward function for `to(device)`: send the gradient back.
#[derive(Debug)]
pub(crate) struct ToDeviceBackward {
    source: Device,
}

impl GradFn for ToDeviceBackward {
    fn name(&self) -> &'static str {
        "ToDeviceBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(compute::copy_to(grad_output, self.source)?)])
    }
}

impl Tensor {
    /// Reinterpret with a new shape of the same element count, sharing storage.
    ///
    /// # Errors
    ///
    /// [`TensorError::ShapeMismatch`](crate::TensorError::ShapeMismatch) when
    /// the element count changes and
    /// [`TensorError::NonContiguous`](crate::TensorError::NonContiguous) when
    /// the tensor is strided; call [`Tensor::contiguous`] first.
    pub fn view(&self, shape: &[usize]) -> Result<Tensor> {
        let out = self.with_layout(self.layout().reshape(shape)?);
        record(out, &[self], || {
            Ok(Box::new(ViewBackward {
                input_shape: SmallVec::from_slice(self.shape()),
            }))
        })
    }

    /// Restrict `dim` to `start..end`, taking every `step`-th element.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let t = Tensor::from_vec((0..10).map(|v| v as f32).collect(), &[10], Device::Cpu).unwrap();
    /// let s = t.slice(0, 1, 8, 3).unwrap();
    /// assert_eq!(s.to_vec(), vec![1.0, 4.0, 7.0]);
    /// assert!(s.is_alias_of(&t));
    /// ```
    pub fn slice(&self, dim: usize, start: usize, end: usize, step: usize) -> Result<Tensor> {
        let out = self.with_layout(self.layout().slice(dim, start, end, step)?);
        record(out, &[self], || {
            Ok(Box::new(SliceBackward {
                input_shape: SmallVec::from_slice(self.shape()),
                dim,
                start,
                end,
                step,
            }))
        })
    }

    /// Swap two axes, sharing storage.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        let out = compute::transposed(self, dim0, dim1)?;
        record(out, &[self], || Ok(Box::new(TransposeBackward { dim0, dim1 })))
    }

    /// Insert an axis of extent 1 before `dim`, sharing storage.
    pub fn unsqueeze(&self, dim: usize) -> Result<Tensor> {
        let out = self.with_layout(self.layout().unsqueeze(dim)?);
        record(out, &[self], || Ok(Box::new(UnsqueezeBackward { dim })))
    }

    /// `self` when already dense, otherwise a dense copy.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.deep_clone()
    }

    /// Copy the data into fresh dense storage on the same device.
    ///
    /// Gradients flow back to `self`; call [`Tensor::detach`] on the result
    /// for an independent value.
    pub fn deep_clone(&self) -> Result<Tensor> {
        let out = compute::materialize(self)?;
        record(out, &[self], || Ok(Box::new(CloneBackward)))
    }

    /// The tensor on `device`: `self` when already there, otherwise a dense
    /// copy into storage on `device`.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        if device == self.device() {
            return Ok(self.clone());
        }
        let out = compute::copy_to(self, device)?;
        record(out, &[self], || {
            Ok(Box::new(ToDeviceBackward {
                source: self.device(),
            }))
        })
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
    fn test_view_shares_storage() {
        let t = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let v = t.view(&[3, 2]).unwrap();
        assert!(v.is_alias_of(&t));
        assert_eq!(v.get(&[2, 1]).unwrap(), 6.0);
        assert!(matches!(t.view(&[4]), Err(TensorError::ShapeMismatch { .. })));
        let weights = Tensor::from_slice(&[1.0, 2.0], &[2], Device::Cpu).unwrap();
        v.mul(&weights).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(t.grad().unwrap().shape(), &[2, 3]);
        assert_eq!(t.grad().unwrap().to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_view_of_transpose_needs_contiguous() {
        let t = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let tt = t.transpose(0, 1).unwrap();
        assert!(matches!(tt.view(&[6]), Err(TensorError::NonContiguous)));
        let flat = tt.contiguous().unwrap().view(&[6]).unwrap();
        assert_eq!(flat.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(!flat.is_alias_of(&t));
    }

    #[test]
    fn test_contiguous_is_noop_alias_when_dense() {
        let t = leaf(&[1.0, 2.0], &[2]);
        let c = t.contiguous().unwrap();
        assert!(c.is_alias_of(&t));
        assert!(c.is_leaf());
    }

    #[test]
    fn test_slice_gradient_scatters() {
        let t = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.slice(1, 0, 3, 2).unwrap();
        assert_eq!(s.to_vec(), vec![1.0, 3.0, 4.0, 6.0]);
        s.sum().unwrap().backward().unwrap();
        assert_eq!(t.grad().unwrap().to_vec(), vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_transpose_gradient() {
        let t = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let weights = Tensor::from_slice(&[1.0, 10.0], &[2], Device::Cpu).unwrap();
        // (3 x 2) * [1, 10] weights the original rows by 1 and 10
        t.transpose(0, 1)
            .unwrap()
            .mul(&weights)
            .unwrap()
            .sum()
            .unwrap()
            .backward()
            .unwrap();
        assert_eq!(t.grad().unwrap().to_vec(), vec![1.0, 1.0, 1.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_deep_clone_then_detach_is_independent() {
        let t = leaf(&[1.0, 2.0], &[2]);
        let c = t.deep_clone().unwrap();
        assert!(!c.is_alias_of(&t));
        assert_eq!(c.grad_fn().unwrap().name(), "CloneBackward");
        let d = c.detach();
        d.set(&[0], 7.0).unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 2.0]);
        assert!(!d.is_alias_of(&t));
    }

    #[test]
    fn test_to_same_device_aliases() {
        let t = leaf(&[1.0], &[1]);
        assert!(t.to(Device::Cpu).unwrap().is_alias_of(&t));
        let moved = t.to(Device::Accelerator).unwrap();
        assert_eq!(moved.device(), Device::Accelerator);
        assert!(!moved.is_alias_of(&t));
        moved.mul_scalar(2.0).unwrap().sum().unwrap().backward().unwrap();
        let grad = t.grad().unwrap();
        assert_eq!(grad.device(), Device::Cpu);
        assert_eq!(grad.to_vec(), vec![2.0]);
    }
}
