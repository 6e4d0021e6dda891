//! Device-global buffers and the per-workgroup scratch tier.

use portable_atomic::{AtomicF64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::grid::Grid;
use crate::Error;

pub(crate) const ELEM_BYTES: usize = std::mem::size_of::<f64>();

/// Bytes of global memory handed out by one device.
#[derive(Debug)]
pub(crate) struct AllocLedger {
    used: AtomicUsize,
    capacity: usize,
}

impl AllocLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    fn reserve(&self, bytes: usize) -> Result<(), Error> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let available = self.capacity.saturating_sub(current);
            if bytes > available {
                return Err(Error::OutOfDeviceMemory {
                    requested: bytes,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

struct DeviceMemory {
    cells: Box<[AtomicF64]>,
    ledger: Arc<AllocLedger>,
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        let bytes = self.cells.len() * ELEM_BYTES;
        debug!(elems = self.cells.len(), bytes, "device_free");
        self.ledger.release(bytes);
    }
}

/// Owning handle to a zero-initialized device array of `f64`.
///
/// Kernels never hold a `DeviceBuffer`; they get a [`BufferView`], which keeps
/// the storage alive for an in-flight launch but cannot free it.
pub struct DeviceBuffer {
    mem: Arc<DeviceMemory>,
}

impl DeviceBuffer {
    pub(crate) fn allocate(len: usize, ledger: &Arc<AllocLedger>) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::InvalidConfig("zero-length allocation".into()));
        }
        let bytes = len.checked_mul(ELEM_BYTES).ok_or(Error::OutOfDeviceMemory {
            requested: usize::MAX,
            available: ledger.capacity.saturating_sub(ledger.used()),
        })?;
        ledger.reserve(bytes)?;
        debug!(elems = len, bytes, "device_alloc");
        let cells = (0..len).map(|_| AtomicF64::new(0.0)).collect();
        Ok(Self {
            mem: Arc::new(DeviceMemory {
                cells,
                ledger: ledger.clone(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.mem.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.cells.is_empty()
    }

    /// Row-major 2D view over `grid`.
    pub fn view_2d(&self, grid: Grid) -> Result<BufferView, Error> {
        if grid.len() != self.len() {
            return Err(Error::InvalidConfig(format!(
                "buffer of {} elements cannot back a {}x{} grid",
                self.len(),
                grid.rows(),
                grid.cols()
            )));
        }
        Ok(BufferView {
            mem: self.mem.clone(),
            cols: grid.cols(),
        })
    }

    /// Copies the device contents back to the host.
    ///
    /// Only meaningful once every launch writing this buffer has been waited on.
    pub fn to_host(&self) -> Vec<f64> {
        self.mem
            .cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer").field("len", &self.len()).finish()
    }
}

/// Non-owning kernel handle to a device buffer.
///
/// Within one launch each work item owns the cells it writes, so plain
/// `Relaxed` accesses are enough; launch completion publishes them.
#[derive(Clone)]
pub struct BufferView {
    mem: Arc<DeviceMemory>,
    cols: usize,
}

impl BufferView {
    pub fn len(&self) -> usize {
        self.mem.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.cells.is_empty()
    }

    #[inline]
    pub fn load(&self, i: usize, j: usize) -> f64 {
        self.load_linear(i * self.cols + j)
    }

    #[inline]
    pub fn store(&self, i: usize, j: usize, value: f64) {
        self.store_linear(i * self.cols + j, value)
    }

    #[inline]
    pub fn load_linear(&self, idx: usize) -> f64 {
        self.mem.cells[idx].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_linear(&self, idx: usize, value: f64) {
        self.mem.cells[idx].store(value, Ordering::Relaxed)
    }
}

/// Fast scratch storage private to one workgroup for one launch.
pub struct LocalTile {
    data: Vec<f64>,
    cols: usize,
}

impl LocalTile {
    pub(crate) fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            cols,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, li: usize, lj: usize) -> f64 {
        self.data[li * self.cols + lj]
    }

    #[inline]
    pub fn set(&mut self, li: usize, lj: usize, value: f64) {
        self.data[li * self.cols + lj] = value;
    }

    #[inline]
    pub fn get_linear(&self, idx: usize) -> f64 {
        self.data[idx]
    }

    #[inline]
    pub fn set_linear(&mut self, idx: usize, value: f64) {
        self.data[idx] = value;
    }
}
