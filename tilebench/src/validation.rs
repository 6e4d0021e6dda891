//! L1 validation of a computed buffer and the pass/fail policy applied to it.

use std::sync::Arc;
use tracing::debug;

use crate::device::Device;
use crate::grid::{Grid, LaunchConfig, TileShape, WorkItem};
use crate::kernels::Kernel;
use crate::memory::{BufferView, DeviceBuffer, LocalTile};
use crate::Error;

/// Largest total L1 error a run may show and still be trusted.
pub const TOLERANCE: f64 = 1e-5;

#[inline]
pub fn expected(i: usize, j: usize) -> f64 {
    ((i + j) as f64).sin()
}

/// Sums `|data(i, j) - sin(i + j)|` per workgroup with a tree reduction in
/// the local tile; item 0 of each group writes the group's partial.
pub struct ValidationKernel {
    data: BufferView,
    partials: BufferView,
}

impl ValidationKernel {
    pub fn new(data: BufferView, partials: BufferView) -> Self {
        Self { data, partials }
    }

    fn strides(tile: TileShape) -> usize {
        tile.len().next_power_of_two().trailing_zeros() as usize
    }
}

impl Kernel for ValidationKernel {
    fn name(&self) -> &'static str {
        "validate"
    }

    // load, one phase per stride, write partial
    fn phases(&self, tile: TileShape) -> usize {
        Self::strides(tile) + 2
    }

    fn uses_local_tile(&self) -> bool {
        true
    }

    // Harness-side reduction scratch; the budget bounds the kernels under test.
    fn local_bytes(&self, _tile: TileShape) -> usize {
        0
    }

    fn execute(&self, phase: usize, item: &WorkItem, local: &mut LocalTile) {
        let lid = item.local_linear_id();
        let members = local.len();
        let width = members.next_power_of_two();
        let strides = width.trailing_zeros() as usize;

        if phase == 0 {
            let err = if item.in_bounds() {
                let (i, j) = item.global_id();
                (self.data.load(i, j) - expected(i, j)).abs()
            } else {
                0.0
            };
            local.set_linear(lid, err);
        } else if phase <= strides {
            let stride = width >> phase;
            if lid < stride && lid + stride < members {
                let sum = local.get_linear(lid) + local.get_linear(lid + stride);
                local.set_linear(lid, sum);
            }
        } else if lid == 0 {
            let (gi, gj) = item.group_id();
            self.partials.store(gi, gj, local.get_linear(0));
        }
    }
}

/// Total absolute error of `data` against the analytic transform.
///
/// Group partials are combined on the host in group order, so the result
/// is reproducible for a fixed tiling.
pub fn validate(device: &Device, data: &DeviceBuffer, config: &LaunchConfig) -> Result<f64, Error> {
    let (groups_rows, groups_cols) = config.group_dims();
    let partials = device.allocate(config.num_groups())?;
    let kernel = ValidationKernel::new(
        data.view_2d(config.grid())?,
        partials.view_2d(Grid::new(groups_rows, groups_cols)?)?,
    );
    device.submit(Arc::new(kernel), config)?.wait()?;

    let err = partials.to_host().into_iter().fold(0.0, |acc, p| acc + p);
    debug!(err, groups = config.num_groups(), "validation_complete");
    Ok(err)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ValidationPolicy {
    pub tolerance: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self { tolerance: TOLERANCE }
    }
}

impl ValidationPolicy {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Passes `err` through when the run can be trusted.
    ///
    /// Zero error over a transcendental function means the compute kernel
    /// never touched the buffer.
    pub fn check(&self, err: f64) -> Result<f64, Error> {
        if err == 0.0 {
            return Err(Error::KernelDidNotRun);
        }
        if err.is_nan() || err > self.tolerance {
            return Err(Error::ValidationFailed {
                error: err,
                tolerance: self.tolerance,
            });
        }
        Ok(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{fill, Solver, EPSILON};
    use tilebench_types::{DeviceSpec, Variant};

    fn device() -> Device {
        Device::new(DeviceSpec {
            compute_units: 4,
            ..DeviceSpec::default()
        })
        .unwrap()
    }

    fn config(device: &Device, rows: usize, cols: usize, tile: (usize, usize)) -> LaunchConfig {
        LaunchConfig::new(
            Grid::new(rows, cols).unwrap(),
            TileShape::new(tile.0, tile.1).unwrap(),
            device.spec(),
        )
        .unwrap()
    }

    #[test]
    fn test_policy_verdicts() {
        let policy = ValidationPolicy::default();
        assert!(matches!(policy.check(0.0), Err(Error::KernelDidNotRun)));
        assert_eq!(policy.check(1.6e-12).unwrap(), 1.6e-12);
        match policy.check(2e-5) {
            Err(Error::ValidationFailed { error, tolerance }) => {
                assert_eq!(error, 2e-5);
                assert_eq!(tolerance, TOLERANCE);
            }
            other => panic!("expected ValidationFailed, got {:?}", other),
        }
        assert!(matches!(policy.check(f64::NAN), Err(Error::ValidationFailed { .. })));
        assert!(policy.check(TOLERANCE).is_ok());
    }

    #[test]
    fn test_strides_for_odd_tiles() {
        assert_eq!(ValidationKernel::strides(TileShape::new(1, 1).unwrap()), 0);
        assert_eq!(ValidationKernel::strides(TileShape::new(1, 128).unwrap()), 7);
        assert_eq!(ValidationKernel::strides(TileShape::new(3, 5).unwrap()), 4);
    }

    #[test]
    fn test_reduction_matches_host_sum() {
        let device = device();
        for tile in [(1, 1), (1, 4), (3, 5), (8, 16), (2, 7)] {
            let cfg = config(&device, 11, 19, tile);
            let buf = device.allocate(cfg.grid().len()).unwrap();
            fill(&device, &buf, &cfg).unwrap().wait().unwrap();

            let host: f64 = buf
                .to_host()
                .iter()
                .enumerate()
                .map(|(idx, v)| (v - expected(idx / 19, idx % 19)).abs())
                .sum();
            let err = validate(&device, &buf, &cfg).unwrap();
            assert!(
                (err - host).abs() <= host * 1e-12,
                "tile {:?}: device {} host {}",
                tile,
                err,
                host
            );
        }
    }

    #[test]
    fn test_unsolved_buffer_fails_policy() {
        let device = device();
        let cfg = config(&device, 8, 8, (1, 8));
        let buf = device.allocate(64).unwrap();
        fill(&device, &buf, &cfg).unwrap().wait().unwrap();
        let err = validate(&device, &buf, &cfg).unwrap();
        assert!(matches!(
            ValidationPolicy::default().check(err),
            Err(Error::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_reduction_ignores_local_memory_budget() {
        // 512 bytes holds 64 cells: too small for a 1x128 local tile.
        let device = Device::new(DeviceSpec {
            compute_units: 2,
            local_mem_bytes: 512,
            ..DeviceSpec::default()
        })
        .unwrap();
        let cfg = config(&device, 8, 128, (1, 128));
        let buf = device.allocate(8 * 128).unwrap();
        fill(&device, &buf, &cfg).unwrap().wait().unwrap();

        assert!(matches!(
            Solver::new(&device, Variant::Local, &buf, &cfg),
            Err(Error::CapacityExceeded { .. })
        ));
        let solver = Solver::new(&device, Variant::Global, &buf, &cfg).unwrap();
        solver.run(&device, &cfg).unwrap();

        let err = validate(&device, &buf, &cfg).unwrap();
        assert!(err > 0.0 && err < TOLERANCE, "err = {:e}", err);
    }

    #[test]
    fn test_exact_buffer_reports_did_not_run() {
        let device = device();
        let cfg = config(&device, 4, 8, (2, 4));
        let buf = device.allocate(32).unwrap();
        let view = buf.view_2d(cfg.grid()).unwrap();
        for i in 0..4 {
            for j in 0..8 {
                view.store(i, j, expected(i, j));
            }
        }
        let err = validate(&device, &buf, &cfg).unwrap();
        assert_eq!(err, 0.0);
        assert!(matches!(
            ValidationPolicy::default().check(err),
            Err(Error::KernelDidNotRun)
        ));
    }

    #[test]
    fn test_scenario_4x4() {
        let device = device();
        let cfg = config(&device, 4, 4, (1, 4));
        for variant in [Variant::Global, Variant::Local] {
            let buf = device.allocate(16).unwrap();
            fill(&device, &buf, &cfg).unwrap().wait().unwrap();
            Solver::new(&device, variant, &buf, &cfg)
                .unwrap()
                .run(&device, &cfg)
                .unwrap();
            let err = validate(&device, &buf, &cfg).unwrap();
            assert!(
                (err - 16.0 * EPSILON).abs() < 16.0 * EPSILON * 1e-2,
                "{:?}: err {}",
                variant,
                err
            );
        }
    }
}
