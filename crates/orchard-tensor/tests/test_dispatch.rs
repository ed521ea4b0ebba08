//! Integration tests for accelerator dispatch and host fallback.
//!
//! The accelerator registry is process-wide, so every test holds `SERIAL`
//! while one is installed.

use orchard_tensor::device::ALIGNMENT;
use orchard_tensor::{
    Accelerator, Backend, Device, GenericBackend, KernelError, KernelOp, Tensor,
    install_accelerator, uninstall_accelerator,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accelerator that owns host memory and delegates kernels to the host loops,
/// counting what it sees.
#[derive(Default)]
struct CountingAccelerator {
    launches: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl Backend for CountingAccelerator {
    fn name(&self) -> &str {
        "counting"
    }

    unsafe fn launch(&self, op: &KernelOp, launch: &orchard_tensor::backend::Launch<'_>) -> Result<(), KernelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        unsafe { GenericBackend.launch(op, launch) }
    }
}

impl Accelerator for CountingAccelerator {
    fn allocate(&self, nbytes: usize) -> Result<NonNull<u8>, KernelError> {
        let layout = Layout::from_size_align(nbytes.max(1), ALIGNMENT)
            .map_err(|err| KernelError::Device(err.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        self.allocations.fetch_add(1, Ordering::SeqCst);
        NonNull::new(ptr).ok_or(KernelError::OutOfMemory { nbytes })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, nbytes: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        let layout = Layout::from_size_align(nbytes.max(1), ALIGNMENT).unwrap();
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

/// Accelerator whose kernels always fail.
#[derive(Default)]
struct FailingAccelerator {
    attempts: AtomicUsize,
}

impl Backend for FailingAccelerator {
    fn name(&self) -> &str {
        "failing"
    }

    unsafe fn launch(&self, op: &KernelOp, _launch: &orchard_tensor::backend::Launch<'_>) -> Result<(), KernelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(KernelError::Unsupported { op: op.name() })
    }
}

impl Accelerator for FailingAccelerator {}

fn operands(device: Device) -> (Tensor, Tensor) {
    let a = Tensor::from_vec((1..=6).map(|v| v as f32).collect(), &[2, 3], device).unwrap();
    let b = Tensor::from_vec(vec![0.5, 2.0, 4.0], &[3], device).unwrap();
    (a, b)
}

/// Run a fixed chain of every kernel and collect the outputs.
fn workload(device: Device) -> Vec<Vec<f32>> {
    let (a, b) = operands(device);
    let m = Tensor::from_vec(vec![1.0, 0.0, 2.0, 1.0, 0.0, 3.0], &[3, 2], device).unwrap();
    vec![
        a.add(&b).unwrap().to_vec(),
        a.mul(&b).unwrap().to_vec(),
        a.div(&b, false).unwrap().to_vec(),
        a.div_scalar(4.0, false).unwrap().to_vec(),
        a.sum().unwrap().to_vec(),
        a.mean_dim(1, true).unwrap().to_vec(),
        a.matmul(&m).unwrap().to_vec(),
        a.transpose(0, 1).unwrap().contiguous().unwrap().to_vec(),
    ]
}

#[test]
fn test_no_accelerator_runs_on_host() {
    let _guard = serial();
    uninstall_accelerator();
    let (a, _) = operands(Device::Accelerator);
    assert_eq!(a.device(), Device::Accelerator);
    assert!(!a.storage().is_accelerator_resident());
    assert_eq!(workload(Device::Accelerator), workload(Device::Cpu));
}

#[test]
fn test_delegating_accelerator_matches_host() {
    let _guard = serial();
    let accel = Arc::new(CountingAccelerator::default());
    install_accelerator(accel.clone());

    let accelerated = workload(Device::Accelerator);
    assert!(accel.launches.load(Ordering::SeqCst) > 0);
    assert!(accel.allocations.load(Ordering::SeqCst) > 0);

    uninstall_accelerator();
    assert_eq!(accelerated, workload(Device::Cpu));
    // every storage from the workload has been dropped
    assert_eq!(
        accel.allocations.load(Ordering::SeqCst),
        accel.frees.load(Ordering::SeqCst)
    );
}

#[test]
fn test_failing_accelerator_falls_back_to_host() {
    let _guard = serial();
    let accel = Arc::new(FailingAccelerator::default());
    install_accelerator(accel.clone());

    let fallback = workload(Device::Accelerator);
    assert!(accel.attempts.load(Ordering::SeqCst) > 0);

    uninstall_accelerator();
    assert_eq!(fallback, workload(Device::Cpu));
}

#[test]
fn test_cpu_tensors_never_reach_accelerator() {
    let _guard = serial();
    let accel = Arc::new(FailingAccelerator::default());
    install_accelerator(accel.clone());

    workload(Device::Cpu);
    assert_eq!(accel.attempts.load(Ordering::SeqCst), 0);

    uninstall_accelerator();
}

#[test]
fn test_accelerator_storage_outlives_uninstall() {
    let _guard = serial();
    let accel = Arc::new(CountingAccelerator::default());
    install_accelerator(accel.clone());
    let t = Tensor::ones(&[4], Device::Accelerator).unwrap();
    assert!(t.storage().is_accelerator_resident());
    uninstall_accelerator();

    assert_eq!(t.sum().unwrap().item().unwrap(), 4.0);
    drop(t);
    assert_eq!(
        accel.allocations.load(Ordering::SeqCst),
        accel.frees.load(Ordering::SeqCst)
    );
}

#[test]
fn test_mixed_devices_are_rejected() {
    let _guard = serial();
    let (a, _) = operands(Device::Cpu);
    let (_, b) = operands(Device::Accelerator);
    assert!(matches!(
        a.add(&b),
        Err(orchard_tensor::TensorError::DeviceMismatch { .. })
    ));
    let moved = b.to(Device::Cpu).unwrap();
    assert_eq!(a.add(&moved).unwrap().shape(), &[2, 3]);
}
