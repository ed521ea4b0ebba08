//! Reference-counted device allocations.
//!
//! A [`Storage`] is a cheap handle to one allocation. Handles share an atomic
//! count; the allocation is released exactly once, when the last handle
//! drops. The device tag and the deallocation route travel with the
//! allocation record, so release always reaches the allocator that produced
//! the memory:
//!
//! ```text
//! Storage ──Arc──> Allocation { ptr, nbytes, device, backing }
//!                                               │
//!                    ┌──────────────────────────┼─────────────────────┐
//!                    ▼                          ▼                     ▼
//!             Host(aligned)            Accelerator(dealloc)   Foreign(release fn)
//! ```

mod buffer;

use crate::backend::{Accelerator, accelerator};
use crate::device::{ALIGNMENT, DType, Device};
use crate::error::{Result, TensorError};
use crate::profiling::{self, Profiler};
use buffer::{HostBuffer, is_aligned};
use std::alloc::Layout as AllocLayout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Callback releasing wrapped foreign memory; receives the original pointer.
pub type ReleaseFn = Box<dyn FnOnce(NonNull<u8>) + Send>;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(0);

enum Backing {
    Host(AllocLayout),
    Accelerator(Arc<dyn Accelerator>),
    Foreign(Mutex<Option<ReleaseFn>>),
}

struct Allocation {
    id: u64,
    ptr: NonNull<u8>,
    nbytes: usize,
    device: Device,
    backing: Backing,
    /// Bumped by every in-place write; saved tensors compare against it.
    version: AtomicU64,
    profiler: Arc<Profiler>,
    logged: bool,
}

// SAFETY: the allocation is plain memory owned by this record; concurrent
// mutation of the same storage is excluded by the caller contract documented
// on `Tensor`.
unsafe impl Send for Allocation {}
// SAFETY: as above.
unsafe impl Sync for Allocation {}

impl Drop for Allocation {
    fn drop(&mut self) {
        match &mut self.backing {
            // SAFETY: pointer and layout come from `HostBuffer::zeroed`.
            Backing::Host(layout) => unsafe { HostBuffer::release(self.ptr, *layout) },
            // SAFETY: pointer came from `accel.allocate(self.nbytes)`.
            Backing::Accelerator(accel) => unsafe { accel.deallocate(self.ptr, self.nbytes) },
            Backing::Foreign(release) => {
                let release = release.get_mut().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(release) = release {
                    release(self.ptr);
                }
            }
        }
        self.profiler
            .track_free(self.id, self.device.label(), self.nbytes, self.logged);
    }
}

/// Shared handle to one allocation.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Allocation>,
}

impl Storage {
    /// Allocate `nbytes` zeroed bytes on `device`, logging to the global profiler.
    ///
    /// Requests for the accelerator fall back to host memory when no
    /// accelerator is installed or it cannot satisfy the request; the storage
    /// still reports (and is profiled as) the requested device.
    pub fn allocate(nbytes: usize, device: Device) -> Result<Self> {
        Self::allocate_with(nbytes, device, profiling::global())
    }

    /// Like [`Storage::allocate`] with an explicit profiler.
    pub fn allocate_with(nbytes: usize, device: Device, profiler: &Arc<Profiler>) -> Result<Self> {
        let (ptr, backing) = match accelerator_memory(nbytes, device) {
            Some((ptr, accel)) => (ptr, Backing::Accelerator(accel)),
            None => {
                let buffer = HostBuffer::zeroed(nbytes)
                    .ok_or(TensorError::AllocationFailure { nbytes, device })?;
                (buffer.ptr, Backing::Host(buffer.layout))
            }
        };
        Ok(Self::register(ptr, nbytes, device, backing, profiler))
    }

    /// Wrap foreign memory without copying.
    ///
    /// `release`, when given, runs exactly once with the original pointer when
    /// the last handle drops. Without it the caller keeps ownership of the
    /// memory. On error the callback is dropped without being called.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `nbytes` bytes until the
    /// storage is released.
    pub unsafe fn wrap(
        ptr: *mut u8,
        nbytes: usize,
        device: Device,
        release: Option<ReleaseFn>,
    ) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        unsafe { Self::wrap_with(ptr, nbytes, device, release, profiling::global()) }
    }

    /// Like [`Storage::wrap`] with an explicit profiler.
    ///
    /// # Safety
    /// See [`Storage::wrap`].
    pub unsafe fn wrap_with(
        ptr: *mut u8,
        nbytes: usize,
        device: Device,
        release: Option<ReleaseFn>,
        profiler: &Arc<Profiler>,
    ) -> Result<Self> {
        let ptr = NonNull::new(ptr).ok_or(TensorError::NullPointer)?;
        let alignment = device.alignment();
        if !is_aligned(ptr.as_ptr(), alignment) {
            return Err(TensorError::Misaligned {
                addr: ptr.as_ptr() as usize,
                alignment,
            });
        }
        let backing = Backing::Foreign(Mutex::new(release));
        Ok(Self::register(ptr, nbytes, device, backing, profiler))
    }

    fn register(
        ptr: NonNull<u8>,
        nbytes: usize,
        device: Device,
        backing: Backing,
        profiler: &Arc<Profiler>,
    ) -> Self {
        let id = NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed);
        let logged = profiler.track_alloc(id, device.label(), nbytes);
        Self {
            inner: Arc::new(Allocation {
                id,
                ptr,
                nbytes,
                device,
                backing,
                version: AtomicU64::new(0),
                profiler: Arc::clone(profiler),
                logged,
            }),
        }
    }

    /// Unique id of the allocation.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn nbytes(&self) -> usize {
        self.inner.nbytes
    }

    /// Device the storage was requested on.
    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Whether the bytes live in accelerator-owned memory.
    pub fn is_accelerator_resident(&self) -> bool {
        matches!(self.inner.backing, Backing::Accelerator(_))
    }

    /// Whether the bytes were wrapped rather than allocated.
    pub fn is_foreign(&self) -> bool {
        matches!(self.inner.backing, Backing::Foreign(_))
    }

    /// Number of elements of `dtype` that fit.
    pub fn capacity(&self, dtype: DType) -> usize {
        self.inner.nbytes / dtype.size_in_bytes()
    }

    /// Base address of the allocation.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr.as_ptr()
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.inner.id)
            .field("nbytes", &self.inner.nbytes)
            .field("device", &self.inner.device)
            .field("refs", &self.ref_count())
            .finish()
    }
}

fn accelerator_memory(nbytes: usize, device: Device) -> Option<(NonNull<u8>, Arc<dyn Accelerator>)> {
    if device != Device::Accelerator {
        return None;
    }
    let accel = accelerator()?;
    match accel.allocate(nbytes) {
        Ok(ptr) if is_aligned(ptr.as_ptr(), ALIGNMENT) => {
            // SAFETY: accelerator memory is host visible and `nbytes` long.
            unsafe { ptr.as_ptr().write_bytes(0, nbytes) };
            Some((ptr, accel))
        }
        Ok(ptr) => {
            warn!(backend = accel.name(), "accelerator returned misaligned memory, using host");
            // SAFETY: returned by `allocate(nbytes)` just above and never used.
            unsafe { accel.deallocate(ptr, nbytes) };
            None
        }
        Err(err) => {
            debug!(backend = accel.name(), nbytes, error = %err, "accelerator allocation failed, using host");
            None
        }
    }
}
