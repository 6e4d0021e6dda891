//! CPU execution substrate: a pool of compute units that run launches one
//! workgroup at a time.
//!
//! A launch is broadcast to every unit. Units claim workgroups from a shared
//! cursor, so groups run concurrently and complete in any order. Inside a
//! group the unit drives every work item through phase `k` before any item
//! enters phase `k + 1`; the [`GroupBarrier`] between phases only opens once
//! every member has arrived.

use crossbeam_channel::{unbounded, Sender};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use quanta::Instant;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tilebench_types::DeviceSpec;
use tracing::{debug, info, info_span, trace, warn};

use crate::grid::{LaunchConfig, Workgroup};
use crate::kernels::Kernel;
use crate::memory::{AllocLedger, DeviceBuffer, LocalTile};
use crate::Error;

const STATUS_PENDING: u32 = 0;
const STATUS_COMPLETE: u32 = 1;
const STATUS_FAILED: u32 = 2;

pub(crate) fn spin_backoff(spin_count: &mut u32) {
    *spin_count += 1;
    if *spin_count < 100 {
        std::hint::spin_loop();
    } else if *spin_count < 1000 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_micros(1));
    }
}

/// Arrival counter for one workgroup.
pub(crate) struct GroupBarrier {
    members: usize,
    arrived: usize,
    generation: u64,
}

impl GroupBarrier {
    pub fn new(members: usize) -> Self {
        Self {
            members,
            arrived: 0,
            generation: 0,
        }
    }

    pub fn arrive(&mut self) {
        self.arrived += 1;
    }

    /// Opens the barrier. Every member must have arrived.
    pub fn release(&mut self) {
        assert_eq!(
            self.arrived, self.members,
            "barrier {} released with {} of {} members",
            self.generation, self.arrived, self.members
        );
        self.arrived = 0;
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Launch {
    kernel: Arc<dyn Kernel>,
    config: LaunchConfig,
    phases: usize,
    cursor: AtomicUsize,
    state: Arc<LaunchState>,
}

/// Completion bookkeeping, kept apart from the kernel so units can drop the
/// kernel (and the buffers it views) before signalling.
struct LaunchState {
    id: u64,
    kernel: &'static str,
    pending: AtomicU32,
    failed: AtomicBool,
    failure: OnceLock<String>,
    status: AtomicU32,
    submitted: Instant,
}

impl LaunchState {
    fn fail(&self, reason: String) {
        warn!(launch = self.id, kernel = self.kernel, %reason, "launch_failed");
        let _ = self.failure.set(reason);
        self.failed.store(true, Ordering::Release);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn unit_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let status = if self.is_failed() {
                STATUS_FAILED
            } else {
                STATUS_COMPLETE
            };
            debug!(
                launch = self.id,
                kernel = self.kernel,
                elapsed_us = self.submitted.elapsed().as_micros() as u64,
                "launch_complete"
            );
            self.status.store(status, Ordering::Release);
        }
    }
}

/// Handle returned by [`Device::submit`]; the launch runs until it is done
/// whether or not anyone waits on it.
#[must_use = "a launch must be waited on before its results are read"]
pub struct Completion {
    state: Arc<LaunchState>,
}

impl Completion {
    /// Blocks until every workgroup of the launch has finished.
    pub fn wait(self) -> Result<(), Error> {
        let mut spin_count = 0u32;
        loop {
            match self.state.status.load(Ordering::Acquire) {
                STATUS_PENDING => spin_backoff(&mut spin_count),
                STATUS_COMPLETE => return Ok(()),
                _ => {
                    let reason = self
                        .state
                        .failure
                        .get()
                        .cloned()
                        .unwrap_or_else(|| "launch aborted".into());
                    return Err(Error::LaunchFailure(reason));
                }
            }
        }
    }
}

pub struct Device {
    spec: DeviceSpec,
    units: Vec<Sender<Arc<Launch>>>,
    handles: Vec<JoinHandle<()>>,
    ledger: Arc<AllocLedger>,
    next_launch: AtomicU64,
}

impl Device {
    pub fn new(spec: DeviceSpec) -> Result<Self, Error> {
        if spec.compute_units == 0 {
            return Err(Error::InvalidConfig("device needs at least one compute unit".into()));
        }
        if spec.max_workgroup_size == 0 {
            return Err(Error::InvalidConfig("max workgroup size must be positive".into()));
        }

        let _span = info_span!("device_init", units = spec.compute_units).entered();
        let prefix = spec
            .thread_name_prefix
            .clone()
            .unwrap_or_else(|| "compute-unit".into());

        let mut units = Vec::with_capacity(spec.compute_units);
        let mut handles = Vec::with_capacity(spec.compute_units);
        for unit_id in 0..spec.compute_units {
            let (tx, rx) = unbounded::<Arc<Launch>>();
            let mut builder = std::thread::Builder::new().name(format!("{}-{}", prefix, unit_id));
            if let Some(stack) = spec.stack_size {
                builder = builder.stack_size(stack);
            }
            let handle = builder
                .spawn(move || {
                    let _span = info_span!("compute_unit", unit_id).entered();
                    info!("compute unit started");
                    for launch in rx.iter() {
                        run_launch(&launch);
                        let state = launch.state.clone();
                        drop(launch);
                        state.unit_done();
                    }
                    info!("compute unit shutting down");
                })
                .map_err(Error::DeviceInit)?;
            units.push(tx);
            handles.push(handle);
        }
        info!(
            max_workgroup_size = spec.max_workgroup_size,
            local_mem_bytes = spec.local_mem_bytes,
            global_mem_bytes = spec.global_mem_bytes,
            "device ready"
        );

        Ok(Self {
            ledger: Arc::new(AllocLedger::new(spec.global_mem_bytes)),
            spec,
            units,
            handles,
            next_launch: AtomicU64::new(0),
        })
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Zero-initialized buffer of `len` elements.
    pub fn allocate(&self, len: usize) -> Result<DeviceBuffer, Error> {
        DeviceBuffer::allocate(len, &self.ledger)
    }

    pub fn free(&self, buffer: DeviceBuffer) {
        drop(buffer);
    }

    pub fn memory_in_use(&self) -> usize {
        self.ledger.used()
    }

    /// Rejects a launch the device cannot hold before any work is queued.
    pub fn check_launch(&self, kernel: &dyn Kernel, config: &LaunchConfig) -> Result<(), Error> {
        let tile = config.tile();
        if tile.len() > self.spec.max_workgroup_size {
            return Err(Error::CapacityExceeded {
                resource: "workgroup size",
                requested: tile.len(),
                limit: self.spec.max_workgroup_size,
            });
        }
        let requested = kernel.local_bytes(tile);
        if requested > self.spec.local_mem_bytes {
            return Err(Error::CapacityExceeded {
                resource: "local memory bytes",
                requested,
                limit: self.spec.local_mem_bytes,
            });
        }
        Ok(())
    }

    pub fn submit(&self, kernel: Arc<dyn Kernel>, config: &LaunchConfig) -> Result<Completion, Error> {
        self.check_launch(kernel.as_ref(), config)?;

        let id = self.next_launch.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(LaunchState {
            id,
            kernel: kernel.name(),
            pending: AtomicU32::new(self.units.len() as u32),
            failed: AtomicBool::new(false),
            failure: OnceLock::new(),
            status: AtomicU32::new(STATUS_PENDING),
            submitted: Instant::now(),
        });
        let launch = Arc::new(Launch {
            phases: kernel.phases(config.tile()).max(1),
            kernel,
            config: *config,
            cursor: AtomicUsize::new(0),
            state: state.clone(),
        });
        debug!(
            launch = id,
            kernel = state.kernel,
            groups = config.num_groups(),
            phases = launch.phases,
            "launch_submit"
        );

        for (unit_id, unit) in self.units.iter().enumerate() {
            if unit.send(launch.clone()).is_err() {
                state.fail(format!("compute unit {} is gone", unit_id));
                state.unit_done();
            }
        }
        Ok(Completion { state })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.units.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_launch(launch: &Launch) {
    let tile = launch.config.tile();
    // Launch-scoped: allocated when the unit picks the launch up, freed when it is done.
    let mut local = if launch.kernel.uses_local_tile() {
        LocalTile::new(tile.rows(), tile.cols())
    } else {
        LocalTile::new(0, 0)
    };

    let num_groups = launch.config.num_groups();
    let mut executed = 0usize;
    loop {
        if launch.state.is_failed() {
            break;
        }
        let g = launch.cursor.fetch_add(1, Ordering::Relaxed);
        if g >= num_groups {
            break;
        }
        let group = launch.config.group(g);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run_group(launch.kernel.as_ref(), &group, launch.phases, &mut local)
        }));
        if let Err(payload) = outcome {
            launch.state.fail(format!(
                "{} panicked in workgroup {:?}: {}",
                launch.kernel.name(),
                group.id(),
                panic_message(payload.as_ref())
            ));
            break;
        }
        executed += 1;
    }
    trace!(launch = launch.state.id, executed, "unit_share_done");
}

fn run_group(kernel: &dyn Kernel, group: &Workgroup, phases: usize, local: &mut LocalTile) {
    let mut barrier = GroupBarrier::new(group.size());
    for phase in 0..phases {
        let last = phase + 1 == phases;
        for item in group.items() {
            kernel.execute(phase, &item, local);
            if !last {
                barrier.arrive();
            }
        }
        if !last {
            barrier.release();
        }
    }
    trace!(group = ?group.id(), barriers = barrier.generation(), "group_done");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
