//! Kernel backends and accelerator-first dispatch.
//!
//! Every compute kernel is described by a [`KernelOp`] plus a [`Launch`]
//! (operand pointers with packed layouts and one output). A [`Backend`] runs
//! launches:
//!
//! - [`GenericBackend`]: strided host loops, always available.
//! - An [`Accelerator`] installed with [`install_accelerator`].
//!
//! When the output lives on [`Device::Accelerator`] the installed accelerator
//! is tried first. Any [`KernelError`] it returns is logged and the launch is
//! recomputed from scratch on the host, so the caller never sees it.
//!
//! # Launch conventions
//!
//! | op | inputs | output |
//! |----|--------|--------|
//! | `Add`, `Mul`, `Div` | two, each laid out over the output extents (broadcast axes have stride 0) | broadcast shape |
//! | `DivScalar`, `Copy` | one, with the output extents | any strided layout |
//! | `Fill` | none | any strided layout |
//! | `Sum`, `Mean` | one | single element |
//! | `SumAxis`, `MeanAxis` | one | input extents with `axis` set to 1 |
//! | `Matmul` | `m x k` and `k x n` | `m x n` |
//!
//! Accelerated kernels must either complete fully or fail without writing to
//! the output.

mod accelerator;
mod generic;

pub use accelerator::{
    Accelerator, accelerator, install_accelerator, require_accelerator, uninstall_accelerator,
};
pub use generic::GenericBackend;

use crate::device::Device;
use crate::error::{KernelError, Result};
use crate::layout::PackedLayout;
use tracing::{debug, trace};

/// A kernel to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelOp {
    Add,
    Mul,
    /// Elementwise divide; `safe` maps zero divisors to 0.
    Div { safe: bool },
    DivScalar { scalar: f32, safe: bool },
    Sum,
    Mean,
    SumAxis { axis: usize },
    MeanAxis { axis: usize },
    Matmul,
    Copy,
    Fill { value: f32 },
}

impl KernelOp {
    pub fn name(&self) -> &'static str {
        match self {
            KernelOp::Add => "add",
            KernelOp::Mul => "mul",
            KernelOp::Div { .. } => "div",
            KernelOp::DivScalar { .. } => "div_scalar",
            KernelOp::Sum => "sum",
            KernelOp::Mean => "mean",
            KernelOp::SumAxis { .. } => "sum_axis",
            KernelOp::MeanAxis { .. } => "mean_axis",
            KernelOp::Matmul => "matmul",
            KernelOp::Copy => "copy",
            KernelOp::Fill { .. } => "fill",
        }
    }

    /// Number of input operands the op expects.
    pub fn arity(&self) -> usize {
        match self {
            KernelOp::Add | KernelOp::Mul | KernelOp::Div { .. } | KernelOp::Matmul => 2,
            KernelOp::Fill { .. } => 0,
            _ => 1,
        }
    }
}

/// Read-only operand of a launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelInput {
    /// Base pointer of the storage; `layout.offset` is applied by the kernel.
    pub ptr: *const f32,
    pub layout: PackedLayout,
}

/// Destination of a launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelOutput {
    /// Base pointer of the storage; `layout.offset` is applied by the kernel.
    pub ptr: *mut f32,
    pub layout: PackedLayout,
}

/// Everything a backend needs to run one kernel.
#[derive(Debug)]
pub struct Launch<'a> {
    pub inputs: &'a [KernelInput],
    pub output: KernelOutput,
    /// Number of output elements.
    pub numel: usize,
}

/// Something that can run kernel launches.
pub trait Backend {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Run `op` over `launch`.
    ///
    /// # Safety
    /// Every pointer in `launch` must be valid for reads (inputs) or writes
    /// (output) at every offset its layout addresses, for the whole call.
    unsafe fn launch(&self, op: &KernelOp, launch: &Launch<'_>) -> std::result::Result<(), KernelError>;
}

/// Run a launch on `device`, trying the accelerator first and falling back to
/// the host.
///
/// # Safety
/// Same contract as [`Backend::launch`].
pub(crate) unsafe fn dispatch(device: Device, op: &KernelOp, launch: &Launch<'_>) -> Result<()> {
    if device == Device::Accelerator {
        match accelerator() {
            Some(accel) => {
                // SAFETY: forwarded from the caller.
                match unsafe { accel.launch(op, launch) } {
                    Ok(()) => return Ok(()),
                    Err(err) => debug!(
                        backend = accel.name(),
                        op = op.name(),
                        error = %err,
                        "accelerated kernel failed, recomputing on host"
                    ),
                }
            }
            None => trace!(op = op.name(), "no accelerator installed, using host kernel"),
        }
    }
    // SAFETY: forwarded from the caller.
    unsafe { GenericBackend.launch(op, launch) }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity() {
        assert_eq!(KernelOp::Add.arity(), 2);
        assert_eq!(KernelOp::DivScalar { scalar: 2.0, safe: false }.arity(), 1);
        assert_eq!(KernelOp::Fill { value: 0.0 }.arity(), 0);
        assert_eq!(KernelOp::SumAxis { axis: 1 }.name(), "sum_axis");
    }
}
