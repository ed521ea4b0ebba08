//! Backward pass execution for reverse-mode automatic differentiation.
//!
//! The pass runs in two phases. Discovery walks every node reachable from
//! the root and counts, per node, how many edges lead to it. Execution then
//! fires nodes from a worklist; a node becomes ready only when every edge
//! leading to it has been processed, so it runs exactly once with the sum
//! of all incoming contributions, however many consumers its output has.

use super::gradients::Gradients;
use super::graph::{Node, NodeId};
use crate::error::Result;
use crate::operations::compute;
use crate::tensor::Tensor;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Execute backward pass from `root`.
///
/// Does nothing when `root` does not require grad. The seed is the root's
/// existing gradient if it has one, otherwise ones of the root's shape; the
/// seed itself is not stored on the root. Every tensor value on the way
/// accumulates its gradient: the first contribution to an empty slot starts
/// from zero, later ones add.
///
/// # Errors
///
/// Any error from a backward function, for example
/// [`TensorError::SavedTensorModified`](crate::TensorError::SavedTensorModified).
/// On error no gradient is changed.
///
/// # Example
///
/// ```
/// use orchard_tensor::{Device, Tensor};
///
/// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu).unwrap();
/// let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2], Device::Cpu).unwrap();
/// a.set_requires_grad(true);
/// b.set_requires_grad(true);
///
/// let loss = a.matmul(&b).unwrap().sum().unwrap();
/// loss.backward().unwrap();
///
/// assert_eq!(a.grad().unwrap().to_vec(), vec![11.0, 15.0, 11.0, 15.0]);
/// assert_eq!(b.grad().unwrap().to_vec(), vec![4.0, 4.0, 6.0, 6.0]);
/// ```
pub fn backward(root: &Tensor) -> Result<()> {
    if !root.requires_grad() {
        trace!("backward on a tensor without gradients, nothing to do");
        return Ok(());
    }
    let slot = root.autograd.current();
    let existing = slot.get();
    let Some(node) = root.grad_fn() else {
        if existing.is_none() {
            slot.replace(Some(root.ones_like()?));
        }
        return Ok(());
    };
    let seed = match existing {
        Some(grad) => grad,
        None => root.ones_like()?,
    };

    let mut dependencies = count_dependencies(&node);
    debug!(root = node.name(), nodes = dependencies.len() + 1, "backward pass started");

    let mut pending: HashMap<NodeId, Tensor> = HashMap::from([(node.id(), seed)]);
    let mut ready = vec![node];
    let mut staged = Gradients::new();

    while let Some(node) = ready.pop() {
        let mut grads = match pending.remove(&node.id()) {
            Some(grad) => node.apply(&grad)?,
            // Every contribution was `None`: propagate nothing, but still
            // release the upstream nodes.
            None => Vec::new(),
        }
        .into_iter();

        for edge in node.edges() {
            let grad = grads.next().flatten();
            let Some(edge) = edge else { continue };
            let upstream = edge
                .producer
                .as_ref()
                .filter(|producer| producer.id() != node.id());

            if let Some(grad) = grad {
                if let Some(producer) = upstream {
                    match pending.entry(producer.id()) {
                        Entry::Occupied(mut entry) => {
                            let sum = compute::accumulate(entry.get(), &grad)?;
                            entry.insert(sum);
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(grad.clone());
                        }
                    }
                }
                staged.accumulate(&edge.slot, grad)?;
            }

            if let Some(producer) = upstream {
                if let Some(count) = dependencies.get_mut(&producer.id()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Arc::clone(producer));
                    }
                }
            }
        }
    }

    debug!(slots = staged.len(), "backward pass finished");
    staged.commit()
}

/// Number of edges leading to each node reachable from `root`.
///
/// Edges from a node to itself are not counted.
fn count_dependencies(root: &Arc<Node>) -> HashMap<NodeId, usize> {
    let mut dependencies = HashMap::new();
    let mut seen = HashSet::from([root.id()]);
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.pop() {
        let producers = node
            .edges()
            .iter()
            .flatten()
            .filter_map(|edge| edge.producer.as_ref());
        for producer in producers {
            if producer.id() == node.id() {
                continue;
            }
            *dependencies.entry(producer.id()).or_insert(0) += 1;
            if seen.insert(producer.id()) {
                stack.push(Arc::clone(producer));
            }
        }
    }
    dependencies
}
