use std::fmt;

/// Identifies the compute device a graph value lives on and, by extension,
/// the backend family the kernel compiles for.
///
/// The fuser does not execute on the device itself; it only needs device
/// identity to pick a backend and to assert that a subgraph is not mixing
/// devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    /// CUDA device with ordinal.
    Cuda(usize),
}

impl Device {
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}
