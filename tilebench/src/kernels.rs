//! The fill kernel and the two compute kernels under comparison.
//!
//! Both compute kernels evaluate `sin(i + j) + EPSILON`, stage the value,
//! cross a group barrier and write it back. They differ only in where the
//! staging cell lives: a device-wide scratch array or the workgroup's
//! [`LocalTile`].

use std::sync::Arc;
use tilebench_types::Variant;

use crate::device::{Completion, Device};
use crate::grid::{LaunchConfig, TileShape, WorkItem};
use crate::memory::{BufferView, DeviceBuffer, LocalTile, ELEM_BYTES};
use crate::Error;

/// Fixed offset added to every computed element to simulate numerical drift.
pub const EPSILON: f64 = 1e-13;

/// Program executed once per work item and phase.
///
/// A kernel with `n` phases has `n - 1` group barriers: no item of a group
/// starts phase `k + 1` until every item of that group has finished phase `k`.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn phases(&self, _tile: TileShape) -> usize {
        1
    }

    /// Whether each workgroup gets a [`LocalTile`] shaped like the tile.
    fn uses_local_tile(&self) -> bool {
        false
    }

    /// Bytes of the device's local memory budget one workgroup claims.
    fn local_bytes(&self, tile: TileShape) -> usize {
        if self.uses_local_tile() {
            tile.len() * ELEM_BYTES
        } else {
            0
        }
    }

    fn execute(&self, phase: usize, item: &WorkItem, local: &mut LocalTile);
}

#[inline]
pub fn transform(i: usize, j: usize) -> f64 {
    ((i + j) as f64).sin() + EPSILON
}

pub struct FillKernel {
    data: BufferView,
}

impl FillKernel {
    pub fn new(data: BufferView) -> Self {
        Self { data }
    }
}

impl Kernel for FillKernel {
    fn name(&self) -> &'static str {
        "fill"
    }

    fn execute(&self, _phase: usize, item: &WorkItem, _local: &mut LocalTile) {
        if !item.in_bounds() {
            return;
        }
        let (i, j) = item.global_id();
        self.data.store(i, j, (i * j) as f64);
    }
}

/// Stages through a device-wide scratch array addressed by global index.
pub struct GlobalMemKernel {
    data: BufferView,
    scratch: BufferView,
}

impl GlobalMemKernel {
    pub fn new(data: BufferView, scratch: BufferView) -> Self {
        Self { data, scratch }
    }
}

impl Kernel for GlobalMemKernel {
    fn name(&self) -> &'static str {
        "solve_global"
    }

    fn phases(&self, _tile: TileShape) -> usize {
        2
    }

    fn execute(&self, phase: usize, item: &WorkItem, _local: &mut LocalTile) {
        if !item.in_bounds() {
            return;
        }
        let (i, j) = item.global_id();
        match phase {
            0 => self.scratch.store(i, j, transform(i, j)),
            // The barrier before this phase guards nothing; it keeps the
            // instruction shape identical to LocalMemKernel.
            _ => self.data.store(i, j, self.scratch.load(i, j)),
        }
    }
}

/// Stages through the workgroup's local tile addressed by local index.
pub struct LocalMemKernel {
    data: BufferView,
}

impl LocalMemKernel {
    pub fn new(data: BufferView) -> Self {
        Self { data }
    }
}

impl Kernel for LocalMemKernel {
    fn name(&self) -> &'static str {
        "solve_local"
    }

    fn phases(&self, _tile: TileShape) -> usize {
        2
    }

    fn uses_local_tile(&self) -> bool {
        true
    }

    fn execute(&self, phase: usize, item: &WorkItem, local: &mut LocalTile) {
        if !item.in_bounds() {
            return;
        }
        let (i, j) = item.global_id();
        let (li, lj) = item.local_id();
        match phase {
            0 => local.set(li, lj, transform(i, j)),
            _ => self.data.store(i, j, local.get(li, lj)),
        }
    }
}

/// Submits the fill kernel over `data`. The caller must wait on the
/// completion before any compute kernel reads the buffer.
pub fn fill(device: &Device, data: &DeviceBuffer, config: &LaunchConfig) -> Result<Completion, Error> {
    let kernel = FillKernel::new(data.view_2d(config.grid())?);
    device.submit(Arc::new(kernel), config)
}

/// A compute kernel bound to one buffer, with the scratch storage its variant needs.
pub struct Solver {
    variant: Variant,
    kernel: Arc<dyn Kernel>,
    scratch: Option<DeviceBuffer>,
}

impl Solver {
    pub fn new(
        device: &Device,
        variant: Variant,
        data: &DeviceBuffer,
        config: &LaunchConfig,
    ) -> Result<Self, Error> {
        let grid = config.grid();
        let view = data.view_2d(grid)?;
        let (kernel, scratch) = match variant {
            Variant::Global => {
                let scratch = device.allocate(grid.len())?;
                let kernel: Arc<dyn Kernel> =
                    Arc::new(GlobalMemKernel::new(view, scratch.view_2d(grid)?));
                (kernel, Some(scratch))
            }
            Variant::Local => {
                let kernel: Arc<dyn Kernel> = Arc::new(LocalMemKernel::new(view));
                (kernel, None)
            }
        };
        device.check_launch(kernel.as_ref(), config)?;
        Ok(Self {
            variant,
            kernel,
            scratch,
        })
    }

    /// Wraps a caller-supplied kernel that needs no device-wide scratch.
    pub fn with_kernel(
        device: &Device,
        variant: Variant,
        kernel: Arc<dyn Kernel>,
        config: &LaunchConfig,
    ) -> Result<Self, Error> {
        device.check_launch(kernel.as_ref(), config)?;
        Ok(Self {
            variant,
            kernel,
            scratch: None,
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Device-wide scratch, present only for [`Variant::Global`].
    pub fn scratch(&self) -> Option<&DeviceBuffer> {
        self.scratch.as_ref()
    }

    pub fn submit(&self, device: &Device, config: &LaunchConfig) -> Result<Completion, Error> {
        device.submit(self.kernel.clone(), config)
    }

    pub fn run(&self, device: &Device, config: &LaunchConfig) -> Result<(), Error> {
        self.submit(device, config)?.wait()
    }
}
