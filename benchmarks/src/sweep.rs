use quanta::Clock;
use tilebench::{
    fill, validate, Device, DeviceBuffer, Error, Grid, LaunchConfig, Solver, TileShape,
    ValidationPolicy,
};
use tilebench_types::{BenchReport, Outcome, SweepSpec, Variant};
use tracing::{info, info_span, warn};

use crate::harness;

/// One point of the sweep: variant x grid x tile rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub variant: Variant,
    pub n1: usize,
    pub n2: usize,
    pub w1: usize,
}

pub fn configurations(spec: &SweepSpec) -> Vec<Configuration> {
    let mut out = Vec::new();
    for &variant in &spec.variants {
        for &n1 in &spec.rows {
            for &n2 in &spec.cols {
                for &w1 in &spec.tile_rows {
                    out.push(Configuration { variant, n1, n2, w1 });
                }
            }
        }
    }
    out
}

struct Measurement {
    iterations: u64,
    times_ms: Vec<f64>,
    err: f64,
}

/// Skipped iteration loop: the launch error plus how many iterations completed.
struct Aborted {
    error: Error,
    iterations: u64,
}

impl From<Error> for Aborted {
    fn from(error: Error) -> Self {
        Self { error, iterations: 0 }
    }
}

fn measure<F>(
    device: &Device,
    cfg: &Configuration,
    tile: TileShape,
    spec: &SweepSpec,
    clock: &Clock,
    make_solver: &F,
) -> Result<Measurement, Aborted>
where
    F: Fn(&Device, Variant, &DeviceBuffer, &LaunchConfig) -> Result<Solver, Error>,
{
    let grid = Grid::new(cfg.n1, cfg.n2)?;
    let launch = LaunchConfig::new(grid, tile, device.spec())?;

    let buffer = device.allocate(grid.len())?;
    fill(device, &buffer, &launch)?.wait()?;
    let solver = make_solver(device, cfg.variant, &buffer, &launch)?;

    for _ in 0..spec.warmup {
        solver.run(device, &launch)?;
    }

    let mut times_ms = Vec::with_capacity(spec.iterations);
    for iteration in 0..spec.iterations {
        let start = clock.now();
        if let Err(error) = solver.run(device, &launch) {
            return Err(Aborted {
                error,
                iterations: iteration as u64,
            });
        }
        times_ms.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let iterations = times_ms.len() as u64;
    let err = validate(device, &buffer, &launch).map_err(|error| Aborted { error, iterations })?;
    device.free(buffer);

    Ok(Measurement {
        iterations,
        times_ms,
        err,
    })
}

/// Runs one configuration end to end. Failures are recorded in the report,
/// never propagated, so sibling configurations keep running.
fn run_configuration<F>(
    device: &Device,
    cfg: &Configuration,
    spec: &SweepSpec,
    clock: &Clock,
    make_solver: &F,
) -> BenchReport
where
    F: Fn(&Device, Variant, &DeviceBuffer, &LaunchConfig) -> Result<Solver, Error>,
{
    let _span = info_span!(
        "configuration",
        variant = cfg.variant.name(),
        n1 = cfg.n1,
        n2 = cfg.n2,
        w1 = cfg.w1
    )
    .entered();

    let mut report = BenchReport {
        variant: cfg.variant,
        n1: cfg.n1,
        n2: cfg.n2,
        w1: cfg.w1,
        w2: 0,
        iterations: 0,
        items_processed: 0,
        bytes_processed: 0,
        median_ms: None,
        mean_ms: None,
        err: None,
        outcome: Outcome::Passed,
    };

    let tile = match TileShape::with_capacity(cfg.w1, spec.workgroup_capacity) {
        Ok(tile) => tile,
        Err(e) => return skip(report, e),
    };
    report.w2 = tile.cols();

    let m = match measure(device, cfg, tile, spec, clock, make_solver) {
        Ok(m) => m,
        Err(aborted) => {
            record_iterations(&mut report, aborted.iterations);
            return skip(report, aborted.error);
        }
    };

    record_iterations(&mut report, m.iterations);
    report.err = Some(m.err);
    if !m.times_ms.is_empty() {
        report.median_ms = Some(harness::median(&m.times_ms));
        report.mean_ms = Some(harness::mean(&m.times_ms));
    }

    match ValidationPolicy::new(spec.tolerance).check(m.err) {
        Ok(err) => {
            info!(err, iterations = m.iterations, median_ms = ?report.median_ms, "configuration passed");
            report
        }
        Err(e) => skip(report, e),
    }
}

fn record_iterations(report: &mut BenchReport, iterations: u64) {
    let elems = (report.n1 * report.n2) as u64;
    report.iterations = iterations;
    report.items_processed = iterations * elems;
    report.bytes_processed = iterations * elems * std::mem::size_of::<f64>() as u64;
}

fn skip(mut report: BenchReport, error: Error) -> BenchReport {
    warn!(%error, "configuration skipped");
    let measured = error.measured_error().or(report.err);
    report.err = measured;
    report.outcome = Outcome::Skipped {
        reason: error.to_string(),
        error: measured,
    };
    report
}

pub fn run_sweep(device: &Device, spec: &SweepSpec) -> Vec<BenchReport> {
    sweep_with(device, spec, &Solver::new)
}

fn sweep_with<F>(device: &Device, spec: &SweepSpec, make_solver: &F) -> Vec<BenchReport>
where
    F: Fn(&Device, Variant, &DeviceBuffer, &LaunchConfig) -> Result<Solver, Error>,
{
    let clock = Clock::new();
    configurations(spec)
        .iter()
        .map(|cfg| run_configuration(device, cfg, spec, &clock, make_solver))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tilebench::{transform, BufferView, Kernel, LocalTile, WorkItem};
    use tilebench_types::DeviceSpec;

    /// Computes like the solvers but panics on its `fail_at`-th launch.
    struct FaultyKernel {
        data: BufferView,
        launches: AtomicUsize,
        fail_at: usize,
    }

    impl Kernel for FaultyKernel {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn execute(&self, _phase: usize, item: &WorkItem, _local: &mut LocalTile) {
            if !item.in_bounds() {
                return;
            }
            let (i, j) = item.global_id();
            if (i, j) == (0, 0) {
                let launch = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
                if launch == self.fail_at {
                    panic!("device fault on launch {}", launch);
                }
            }
            self.data.store(i, j, transform(i, j));
        }
    }

    fn spec() -> SweepSpec {
        SweepSpec {
            rows: vec![16, 33],
            cols: vec![128],
            tile_rows: vec![1, 8],
            workgroup_capacity: 128,
            variants: vec![Variant::Global, Variant::Local],
            iterations: 3,
            warmup: 1,
            tolerance: 1e-5,
            device: DeviceSpec {
                compute_units: 2,
                ..DeviceSpec::default()
            },
        }
    }

    #[test]
    fn test_configurations_cover_product() {
        let cfgs = configurations(&spec());
        assert_eq!(cfgs.len(), 2 * 2 * 1 * 2);
        assert_eq!(cfgs[0], Configuration { variant: Variant::Global, n1: 16, n2: 128, w1: 1 });
        assert_eq!(cfgs[7], Configuration { variant: Variant::Local, n1: 33, n2: 128, w1: 8 });
    }

    #[test]
    fn test_sweep_reports_metrics() {
        let spec = spec();
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);
        assert_eq!(reports.len(), 8);
        for r in &reports {
            assert!(r.passed(), "{:?}", r.outcome);
            assert_eq!(r.w1 * r.w2, 128);
            assert_eq!(r.iterations, 3);
            assert_eq!(r.items_processed, 3 * (r.n1 * r.n2) as u64);
            assert_eq!(r.bytes_processed, r.items_processed * 8);
            let err = r.err.unwrap();
            assert!(err > 0.0 && err < 1e-5);
            assert!(r.median_ms.is_some() && r.mean_ms.is_some());
        }
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_bad_configuration_does_not_abort_siblings() {
        let mut spec = spec();
        spec.rows = vec![16];
        spec.tile_rows = vec![3, 2, 256];
        spec.variants = vec![Variant::Local];
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);

        assert_eq!(reports.len(), 3);
        match &reports[0].outcome {
            Outcome::Skipped { reason, error } => {
                assert!(reason.contains("do not divide"));
                assert!(error.is_none());
            }
            other => panic!("expected skip, got {:?}", other),
        }
        assert!(reports[1].passed());
        assert_eq!(reports[1].w2, 64);
        // 256 rows x 0.5 columns is not a tile.
        assert!(!reports[2].passed());
    }

    #[test]
    fn test_tolerance_violation_is_recorded_with_error() {
        let mut spec = spec();
        spec.rows = vec![16];
        spec.tile_rows = vec![1];
        spec.variants = vec![Variant::Global];
        spec.tolerance = 1e-20;
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);

        let r = &reports[0];
        assert!(r.gitems_per_sec().is_none());
        match &r.outcome {
            Outcome::Skipped { reason, error } => {
                assert!(reason.contains("numerical error"));
                assert_eq!(*error, r.err);
                assert!(error.unwrap() > 0.0);
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_iterations_fails_validation() {
        let mut spec = spec();
        spec.rows = vec![16];
        spec.tile_rows = vec![1];
        spec.variants = vec![Variant::Local];
        spec.iterations = 0;
        spec.warmup = 0;
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);

        // Only fill ran, so the error is large rather than zero.
        assert!(!reports[0].passed());
        assert_eq!(reports[0].iterations, 0);
        assert!(reports[0].median_ms.is_none());
    }

    #[test]
    fn test_global_variant_passes_under_small_local_memory() {
        let mut spec = spec();
        spec.rows = vec![8];
        spec.tile_rows = vec![1];
        spec.device.local_mem_bytes = 512;
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);

        assert_eq!(reports.len(), 2);
        let global = &reports[0];
        assert_eq!(global.variant, Variant::Global);
        assert!(global.passed(), "{:?}", global.outcome);
        assert_eq!(global.iterations, 3);

        let local = &reports[1];
        match &local.outcome {
            Outcome::Skipped { reason, .. } => assert!(reason.contains("local memory bytes")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_failure_keeps_completed_iterations() {
        let mut spec = spec();
        spec.rows = vec![16];
        spec.tile_rows = vec![1];
        spec.variants = vec![Variant::Global];
        // Data and scratch fit; the 16 group partials do not.
        spec.device.global_mem_bytes = 2 * 16 * 128 * 8 + 64;
        let device = Device::new(spec.device.clone()).unwrap();
        let reports = run_sweep(&device, &spec);

        let r = &reports[0];
        match &r.outcome {
            Outcome::Skipped { reason, error } => {
                assert!(reason.contains("out of device memory"), "{}", reason);
                assert!(error.is_none());
            }
            other => panic!("expected skip, got {:?}", other),
        }
        assert_eq!(r.iterations, 3);
        assert_eq!(r.items_processed, 3 * 16 * 128);
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_launch_failure_skips_only_its_configuration() {
        let mut spec = spec();
        spec.rows = vec![16];
        spec.tile_rows = vec![1];
        let device = Device::new(spec.device.clone()).unwrap();

        // Warmup is launch 1, so launch 3 is the second timed iteration.
        let reports = sweep_with(
            &device,
            &spec,
            &|device: &Device,
              variant: Variant,
              data: &DeviceBuffer,
              launch: &LaunchConfig|
             -> Result<Solver, Error> {
                match variant {
                    Variant::Global => {
                        let kernel: Arc<dyn Kernel> = Arc::new(FaultyKernel {
                            data: data.view_2d(launch.grid())?,
                            launches: AtomicUsize::new(0),
                            fail_at: 3,
                        });
                        Solver::with_kernel(device, variant, kernel, launch)
                    }
                    Variant::Local => Solver::new(device, variant, data, launch),
                }
            },
        );

        assert_eq!(reports.len(), 2);
        let failed = &reports[0];
        match &failed.outcome {
            Outcome::Skipped { reason, error } => {
                assert!(reason.contains("launch failed"), "{}", reason);
                assert!(reason.contains("device fault on launch 3"), "{}", reason);
                assert!(error.is_none());
            }
            other => panic!("expected skip, got {:?}", other),
        }
        assert_eq!(failed.iterations, 1);
        assert!(failed.median_ms.is_none());

        assert_eq!(reports[1].variant, Variant::Local);
        assert!(reports[1].passed(), "{:?}", reports[1].outcome);
        assert_eq!(device.memory_in_use(), 0);
    }
}
