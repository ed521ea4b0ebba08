//! Accelerator trait and the process-wide registry.

use super::Backend;
use crate::device::Device;
use crate::error::{KernelError, Result, TensorError};
use once_cell::sync::Lazy;
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// A non-host compute target.
///
/// Memory returned by [`allocate`](Accelerator::allocate) must be host
/// visible and aligned to [`ALIGNMENT`](crate::device::ALIGNMENT); the host
/// fallback reads and writes it directly. Launches may also receive host
/// allocations (storages that fell back at allocation time); an accelerator
/// that cannot use them returns an error and the host recomputes.
pub trait Accelerator: Backend + Send + Sync {
    /// Allocate `nbytes` of device memory.
    fn allocate(&self, nbytes: usize) -> std::result::Result<NonNull<u8>, KernelError> {
        let _ = nbytes;
        Err(KernelError::Unsupported { op: "allocate" })
    }

    /// Free memory from [`allocate`](Accelerator::allocate).
    ///
    /// # Safety
    /// `ptr` must come from `self.allocate(nbytes)` and not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, nbytes: usize) {
        let _ = (ptr, nbytes);
    }
}

type Slot = RwLock<Option<Arc<dyn Accelerator>>>;

static ACCELERATOR: Lazy<Slot> = Lazy::new(|| RwLock::new(None));

/// Install `accel` as the process-wide accelerator, returning the previous one.
pub fn install_accelerator(accel: Arc<dyn Accelerator>) -> Option<Arc<dyn Accelerator>> {
    debug!(backend = accel.name(), "installing accelerator");
    ACCELERATOR
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(accel)
}

/// Remove the installed accelerator.
///
/// Storages already allocated on it keep it alive until they are released.
pub fn uninstall_accelerator() -> Option<Arc<dyn Accelerator>> {
    ACCELERATOR
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

/// The installed accelerator, if any.
pub fn accelerator() -> Option<Arc<dyn Accelerator>> {
    ACCELERATOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// The installed accelerator, or [`TensorError::DeviceUnavailable`].
pub fn require_accelerator() -> Result<Arc<dyn Accelerator>> {
    accelerator().ok_or(TensorError::DeviceUnavailable {
        device: Device::Accelerator,
    })
}
