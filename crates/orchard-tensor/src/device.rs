//! Device and element type tags.

use std::fmt;

/// Byte alignment every allocation and wrapped pointer must satisfy.
pub const ALIGNMENT: usize = 64;

/// Where a tensor's storage lives.
///
/// Accelerator memory is host-visible (unified memory), so host kernels can
/// always read it when an accelerated launch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// The installed accelerator, if any.
    Accelerator,
}

impl Device {
    /// Stable label written to the profiling log.
    pub fn label(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Accelerator => "accel",
        }
    }

    /// Natural alignment of pointers on this device.
    pub fn alignment(self) -> usize {
        ALIGNMENT
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    /// 32-bit IEEE float.
    #[default]
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => std::mem::size_of::<f32>(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
