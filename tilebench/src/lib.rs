//! Global-memory versus local-scratch staging for a tiled elementwise
//! transform, run on a workgroup-based execution substrate.

pub use tilebench_types::{BenchReport, DeviceSpec, Outcome, SweepSpec, Variant};

pub mod device;
pub mod grid;
pub mod kernels;
pub mod memory;
pub mod validation;

pub use crate::device::{Completion, Device};
pub use crate::grid::{Grid, LaunchConfig, TileShape, WorkItem, Workgroup};
pub use crate::kernels::{fill, transform, FillKernel, GlobalMemKernel, Kernel, LocalMemKernel, Solver, EPSILON};
pub use crate::memory::{BufferView, DeviceBuffer, LocalTile};
pub use crate::validation::{expected, validate, ValidationKernel, ValidationPolicy, TOLERANCE};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{resource} exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded {
        resource: &'static str,
        requested: usize,
        limit: usize,
    },
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: usize, available: usize },
    #[error("launch failed: {0}")]
    LaunchFailure(String),
    #[error("validation failed with numerical error == 0, kernel probably didn't run")]
    KernelDidNotRun,
    #[error("validation failed with numerical error = {error:e} (tolerance {tolerance:e})")]
    ValidationFailed { error: f64, tolerance: f64 },
    #[error("device initialization failed: {0}")]
    DeviceInit(#[source] std::io::Error),
}

impl Error {
    /// Measured L1 error carried by the failure, if any.
    pub fn measured_error(&self) -> Option<f64> {
        match self {
            Error::ValidationFailed { error, .. } => Some(*error),
            Error::KernelDidNotRun => Some(0.0),
            _ => None,
        }
    }
}
