use serde::{Deserialize, Serialize};

/// Where a compute kernel stages its values before writeback.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Global = 0,
    Local = 1,
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Variant::Global => "GlobalMem",
            Variant::Local => "LocalMem",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceSpec {
    pub compute_units: usize,
    pub max_workgroup_size: usize,
    pub local_mem_bytes: usize,
    pub global_mem_bytes: usize,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: Option<String>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(16)
            .max(1);
        Self {
            compute_units,
            max_workgroup_size: 1024,
            local_mem_bytes: 64 * 1024,
            global_mem_bytes: 4 << 30,
            stack_size: Some(256 * 1024),
            thread_name_prefix: Some("compute-unit".into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SweepSpec {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub tile_rows: Vec<usize>,
    /// Work items per group; the tile width is derived as `workgroup_capacity / tile_rows`.
    pub workgroup_capacity: usize,
    pub variants: Vec<Variant>,
    pub iterations: usize,
    pub warmup: usize,
    pub tolerance: f64,
    pub device: DeviceSpec,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Self {
            rows: vec![4096, 8192],
            cols: vec![128],
            tile_rows: vec![1],
            workgroup_capacity: 128,
            variants: vec![Variant::Global, Variant::Local],
            iterations: 10,
            warmup: 1,
            tolerance: 1e-5,
            device: DeviceSpec::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Skipped { reason: String, error: Option<f64> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub variant: Variant,
    pub n1: usize,
    pub n2: usize,
    pub w1: usize,
    pub w2: usize,
    pub iterations: u64,
    pub items_processed: u64,
    pub bytes_processed: u64,
    pub median_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub err: Option<f64>,
    pub outcome: Outcome,
}

impl BenchReport {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// Elements per second in billions, only for configurations that passed validation.
    pub fn gitems_per_sec(&self) -> Option<f64> {
        if !self.passed() {
            return None;
        }
        let median_ms = self.median_ms?;
        if median_ms <= 0.0 {
            return None;
        }
        let per_iter = (self.n1 * self.n2) as f64;
        Some(per_iter / (median_ms * 1e-3) / 1e9)
    }
}
