use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tilebench_types::{BenchReport, SweepSpec};

pub const COMPUTE_UNITS_ENV: &str = "TILEBENCH_COMPUTE_UNITS";

pub fn load_sweep(path: &Path) -> Result<SweepSpec, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid sweep config {}: {}", path.display(), e))
}

/// Applies `TILEBENCH_COMPUTE_UNITS` when it holds a positive integer.
pub fn apply_env(spec: &mut SweepSpec) {
    if let Some(units) = std::env::var(COMPUTE_UNITS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
    {
        spec.device.compute_units = units;
    }
}

pub fn parse_list(raw: &str) -> Option<Vec<usize>> {
    let values: Option<Vec<usize>> = raw
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect();
    values.filter(|v| !v.is_empty())
}

pub fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// Writes the reports as JSON to `dest`, or to stdout when `dest` is `-`.
pub fn write_json(dest: &str, reports: &[BenchReport]) -> Result<(), String> {
    let json = serde_json::to_string_pretty(reports).map_err(|e| e.to_string())?;
    if dest == "-" {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", json).map_err(|e| e.to_string())
    } else {
        fs::write(dest, json + "\n").map_err(|e| format!("cannot write {}: {}", dest, e))
    }
}
