//! Staged gradient accumulation.

use super::graph::GradSlot;
use crate::error::Result;
use crate::operations::compute;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::sync::Arc;

/// Gradients produced by one backward pass, keyed by slot.
///
/// Nothing is written to the slots until [`Gradients::commit`], so a pass
/// that fails halfway leaves every tensor's gradient as it was.
#[derive(Debug, Default)]
pub(crate) struct Gradients {
    grads: HashMap<u64, (Arc<GradSlot>, Tensor)>,
}

impl Gradients {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accumulate gradient for a slot.
    ///
    /// If gradient already exists, adds to it (for multiple paths).
    pub(crate) fn accumulate(&mut self, slot: &Arc<GradSlot>, grad: Tensor) -> Result<()> {
        match self.grads.get_mut(&slot.id()) {
            Some((_, existing)) => *existing = compute::accumulate(existing, &grad)?,
            None => {
                self.grads.insert(slot.id(), (Arc::clone(slot), grad));
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.grads.len()
    }

    /// Add the staged gradients into their slots.
    ///
    /// An empty slot starts from zero, so it receives a fresh copy rather
    /// than an alias of a tensor computed during the pass. All sums are
    /// formed before any slot is written.
    pub(crate) fn commit(self) -> Result<()> {
        let merged = self
            .grads
            .into_values()
            .map(|(slot, grad)| {
                let total = match slot.get() {
                    Some(existing) => compute::accumulate(&existing, &grad)?,
                    None => compute::materialize(&grad)?,
                };
                Ok((slot, total))
            })
            .collect::<Result<Vec<_>>>()?;
        for (slot, total) in merged {
            slot.replace(Some(total));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::error::TensorError;

    fn tensor(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, &[data.len()], Device::Cpu).unwrap()
    }

    #[test]
    fn test_gradients_accumulate_multiple() {
        let slot = Arc::new(GradSlot::new());
        let mut grads = Gradients::new();
        grads.accumulate(&slot, tensor(&[1.0, 2.0, 3.0])).unwrap();
        grads.accumulate(&slot, tensor(&[4.0, 5.0, 6.0])).unwrap();
        assert_eq!(grads.len(), 1);
        assert!(slot.get().is_none());
        grads.commit().unwrap();
        assert_eq!(slot.get().unwrap().to_vec(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_commit_adds_to_existing() {
        let slot = Arc::new(GradSlot::new());
        slot.replace(Some(tensor(&[1.0, 1.0])));
        let mut grads = Gradients::new();
        grads.accumulate(&slot, tensor(&[2.0, 3.0])).unwrap();
        grads.commit().unwrap();
        assert_eq!(slot.get().unwrap().to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_commit_copies_into_empty_slot() {
        let slot = Arc::new(GradSlot::new());
        let grad = tensor(&[2.0]);
        let mut grads = Gradients::new();
        grads.accumulate(&slot, grad.clone()).unwrap();
        grads.commit().unwrap();
        assert!(!slot.get().unwrap().is_alias_of(&grad));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let slot = Arc::new(GradSlot::new());
        let mut grads = Gradients::new();
        grads.accumulate(&slot, tensor(&[1.0])).unwrap();
        assert!(matches!(
            grads.accumulate(&slot, tensor(&[1.0, 2.0])),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
