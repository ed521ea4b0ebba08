//! Tracked matrix multiply with backward pass.

use crate::autodiff::graph::{GradFn, record};
use crate::autodiff::saved_tensor::SavedTensor;
use crate::error::Result;
use crate::operations::compute;
use crate::tensor::Tensor;

/// Backward function for `C = A @ B`.
///
/// dA = dC @ Bᵀ and dB = Aᵀ @ dC; the transposes are stride views.
#[derive(Debug)]
pub(crate) struct MatmulBackward {
    lhs: SavedTensor,
    rhs: SavedTensor,
}

impl GradFn for MatmulBackward {
    fn name(&self) -> &'static str {
        "MatmulBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let a = self.lhs.value(self.name())?;
        let b = self.rhs.value(self.name())?;
        let grad_a = compute::matmul(grad_output, &compute::transposed(b, 0, 1)?)?;
        let grad_b = compute::matmul(&compute::transposed(a, 0, 1)?, grad_output)?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
}

impl Tensor {
    /// Matrix product of two rank-2 tensors, `(m x k) @ (k x n)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu).unwrap();
    /// let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2], Device::Cpu).unwrap();
    /// assert_eq!(a.matmul(&b).unwrap().to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let out = compute::matmul(self, other)?;
        record(out, &[self, other], || {
            Ok(Box::new(MatmulBackward {
                lhs: SavedTensor::new(self),
                rhs: SavedTensor::new(other),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::device::Device;
    use crate::tensor::Tensor;

    #[test]
    fn test_matmul_rectangular_gradients() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], Device::Cpu).unwrap();
        let b = Tensor::from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2], Device::Cpu).unwrap();
        a.set_requires_grad(true);
        b.set_requires_grad(true);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.to_vec(), vec![4.0, 5.0, 10.0, 11.0]);
        c.sum().unwrap().backward().unwrap();
        // dA[i][p] = sum_j B[p][j], dB[p][j] = sum_i A[i][p]
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]);
    }

    #[test]
    fn test_matmul_of_transposed_view() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu).unwrap();
        let at = a.transpose(0, 1).unwrap();
        let eye = Tensor::from_slice(&[1.0, 0.0, 0.0, 1.0], &[2, 2], Device::Cpu).unwrap();
        assert_eq!(at.matmul(&eye).unwrap().to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }
}
