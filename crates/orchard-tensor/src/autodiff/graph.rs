//! Computation graph for reverse-mode automatic differentiation.
//!
//! The graph is built eagerly while ops run. Every tensor carries an
//! [`AutogradMeta`]; an op with a gradient-enabled operand creates a [`Node`]
//! holding its [`GradFn`] and one [`Edge`] per operand, and installs the node
//! as the producer of its output. Nodes are shared through `Arc`, so a node
//! lives exactly as long as some tensor (or a downstream node) still
//! references it.
//!
//! ```text
//! Tensor ──autograd──► AutogradMeta ──grad_fn──► Node ──edges──► Edge { slot, producer }
//!                          │                                        │        │
//!                          └──current──► GradSlot ◄─────────────────┘        ▼
//!                                                                       Node (upstream)
//! ```
//!
//! A [`GradSlot`] is where gradients for one tensor value accumulate. In-place
//! ops create a new value while keeping the handle, so they retire the
//! tensor's current slot (still referenced by the edges that captured it) and
//! start a fresh one.

use crate::error::Result;
use crate::tensor::Tensor;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

/// Backward function trait.
///
/// Computes the vector-Jacobian product of one op: given the gradient of its
/// output, return one gradient per operand, in operand order, shaped like the
/// operand. `None` means the operand receives no gradient.
pub trait GradFn: Debug + Send + Sync {
    /// Name reported by [`Tensor::grad_fn`].
    fn name(&self) -> &'static str;

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;
}

/// Accumulation target for the gradient of one tensor value.
pub(crate) struct GradSlot {
    id: u64,
    grad: Mutex<Option<Tensor>>,
}

impl GradSlot {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            grad: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn get(&self) -> Option<Tensor> {
        self.grad.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn replace(&self, grad: Option<Tensor>) -> Option<Tensor> {
        let mut slot = self.grad.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, grad)
    }
}

impl Debug for GradSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradSlot").field("id", &self.id).finish()
    }
}

/// Link from a node to one of its operands.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    /// Slot of the operand value the node consumed.
    pub(crate) slot: Arc<GradSlot>,
    /// Node that produced that value; `None` for leaves.
    pub(crate) producer: Option<Arc<Node>>,
}

/// A node in the computation graph.
pub struct Node {
    id: NodeId,
    grad_fn: Box<dyn GradFn>,
    /// One entry per operand; `None` where the operand does not require grad.
    edges: Vec<Option<Edge>>,
}

impl Node {
    pub(crate) fn new(grad_fn: Box<dyn GradFn>, edges: Vec<Option<Edge>>) -> Self {
        Self {
            id: NodeId::next(),
            grad_fn,
            edges,
        }
    }

    /// Get node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Name of the backward function.
    pub fn name(&self) -> &'static str {
        self.grad_fn.name()
    }

    pub(crate) fn edges(&self) -> &[Option<Edge>] {
        &self.edges
    }

    pub(crate) fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        self.grad_fn.backward(grad_output)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("grad_fn", &self.grad_fn.name())
            .field("edges", &self.edges.len())
            .finish()
    }
}

/// Gradient state carried by every tensor handle.
///
/// Shallow copies of a tensor share one `AutogradMeta`; views, detached
/// tensors and op outputs get their own.
pub(crate) struct AutogradMeta {
    requires_grad: AtomicBool,
    /// Slot of the value the tensor was created with; `grad()` reads it.
    origin: Arc<GradSlot>,
    /// Slot of the value the tensor holds now.
    current: Mutex<Arc<GradSlot>>,
    grad_fn: Mutex<Option<Arc<Node>>>,
}

impl AutogradMeta {
    pub(crate) fn new(requires_grad: bool) -> Self {
        let origin = Arc::new(GradSlot::new());
        Self {
            requires_grad: AtomicBool::new(requires_grad),
            current: Mutex::new(Arc::clone(&origin)),
            origin,
            grad_fn: Mutex::new(None),
        }
    }

    pub(crate) fn with_producer(node: Arc<Node>) -> Self {
        let meta = Self::new(true);
        *meta.grad_fn.lock().unwrap_or_else(PoisonError::into_inner) = Some(node);
        meta
    }

    pub(crate) fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::Acquire)
    }

    pub(crate) fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.store(requires_grad, Ordering::Release);
    }

    pub(crate) fn origin(&self) -> &Arc<GradSlot> {
        &self.origin
    }

    pub(crate) fn current(&self) -> Arc<GradSlot> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn grad_fn(&self) -> Option<Arc<Node>> {
        self.grad_fn.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Edge to the value this tensor holds now.
    pub(crate) fn edge(&self) -> Edge {
        Edge {
            slot: self.current(),
            producer: self.grad_fn(),
        }
    }

    /// Install `node` as producer of a new value held by the same handle.
    ///
    /// The edge to the previous value must already be captured by `node`.
    pub(crate) fn rebase(&self, node: Arc<Node>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(GradSlot::new());
        *self.grad_fn.lock().unwrap_or_else(PoisonError::into_inner) = Some(node);
        self.set_requires_grad(true);
    }
}

impl Debug for AutogradMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutogradMeta")
            .field("requires_grad", &self.requires_grad())
            .field("grad_fn", &self.grad_fn().map(|node| node.name()))
            .finish()
    }
}

/// Attach a backward node to `output` when any of `inputs` requires grad.
///
/// `grad_fn` is only called when a node is actually created, so snapshots
/// of operands are not taken for untracked computations.
pub(crate) fn record<F>(mut output: Tensor, inputs: &[&Tensor], grad_fn: F) -> Result<Tensor>
where
    F: FnOnce() -> Result<Box<dyn GradFn>>,
{
    if !inputs.iter().any(|input| input.requires_grad()) {
        return Ok(output);
    }
    let edges = inputs
        .iter()
        .map(|input| input.requires_grad().then(|| input.autograd.edge()))
        .collect();
    let node = Arc::new(Node::new(grad_fn()?, edges));
    output.autograd = Arc::new(AutogradMeta::with_producer(node));
    Ok(output)
}
