//! Tracked sum and mean reductions.

use crate::autodiff::graph::{GradFn, record};
use crate::error::Result;
use crate::operations::compute;
use crate::strides::Dims;
use crate::tensor::Tensor;
use smallvec::SmallVec;

/// Which elements a reduction folded together.
#[derive(Debug, Clone, Copy)]
enum Extent {
    All,
    Axis { axis: usize, keepdim: bool },
}

/// Backward function for `sum`/`mean`: spread the incoming gradient back over
/// the reduced elements, divided by their count for a mean.
#[derive(Debug)]
pub(crate) struct ReduceBackward {
    input_shape: Dims,
    extent: Extent,
    mean: bool,
}

impl GradFn for ReduceBackward {
    fn name(&self) -> &'static str {
        if self.mean { "MeanBackward" } else { "SumBackward" }
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (grad, count) = match self.extent {
            Extent::All => (grad_output.clone(), self.input_shape.iter().product::<usize>()),
            Extent::Axis { axis, keepdim: true } => (grad_output.clone(), self.input_shape[axis]),
            Extent::Axis { axis, keepdim: false } => (
                grad_output.with_layout(grad_output.layout().unsqueeze(axis)?),
                self.input_shape[axis],
            ),
        };
        let expanded = compute::expand(&grad, &self.input_shape)?;
        let grad = if self.mean {
            compute::div_scalar(&expanded, count as f32, false)?
        } else {
            expanded
        };
        Ok(vec![Some(grad)])
    }
}

impl Tensor {
    /// Sum of every element, as a rank-0 tensor.
    pub fn sum(&self) -> Result<Tensor> {
        self.reduce(Extent::All, false)
    }

    /// Mean of every element, as a rank-0 tensor.
    pub fn mean(&self) -> Result<Tensor> {
        self.reduce(Extent::All, true)
    }

    /// Sum over `dim`.
    ///
    /// With `keepdim` the axis stays with extent 1; otherwise it is removed
    /// and later axes shift down.
    ///
    /// # Examples
    ///
    /// ```
    /// use orchard_tensor::{Device, Tensor};
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], Device::Cpu).unwrap();
    /// assert_eq!(t.sum_dim(1, false).unwrap().to_vec(), vec![6.0, 15.0]);
    /// assert_eq!(t.sum_dim(0, true).unwrap().shape(), &[1, 3]);
    /// ```
    pub fn sum_dim(&self, dim: usize, keepdim: bool) -> Result<Tensor> {
        self.reduce(Extent::Axis { axis: dim, keepdim }, false)
    }

    /// Mean over `dim`; see [`Tensor::sum_dim`].
    pub fn mean_dim(&self, dim: usize, keepdim: bool) -> Result<Tensor> {
        self.reduce(Extent::Axis { axis: dim, keepdim }, true)
    }

    fn reduce(&self, extent: Extent, mean: bool) -> Result<Tensor> {
        let out = match extent {
            Extent::All => compute::reduce_all(self, mean)?,
            Extent::Axis { axis, keepdim } => compute::reduce_axis(self, axis, keepdim, mean)?,
        };
        record(out, &[self], || {
            Ok(Box::new(ReduceBackward {
                input_shape: SmallVec::from_slice(self.shape()),
                extent,
                mean,
            }))
        })
    }
}
