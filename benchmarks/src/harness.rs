use tilebench_types::{BenchReport, Outcome};

/// Median of per-iteration times; NaN when nothing was measured.
pub fn median(times: &[f64]) -> f64 {
    if times.is_empty() {
        return f64::NAN;
    }
    let mut sorted = times.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

pub fn mean(times: &[f64]) -> f64 {
    if times.is_empty() {
        return f64::NAN;
    }
    times.iter().sum::<f64>() / times.len() as f64
}

pub fn bench_name(r: &BenchReport) -> String {
    format!("BM_{}/{}/{}", r.variant.name(), r.n1, r.n2)
}

/// Print a sweep table to stdout. Skipped configurations show their reason
/// instead of a throughput figure.
pub fn print_table(reports: &[BenchReport]) {
    let name_w = 24;
    let col_w = 11;

    println!();
    println!(
        "{:<name_w$} {:>8} {:>7} {:>col_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>6}",
        "Benchmark", "Tile", "Iters", "Median", "Mean", "Gitems/s", "Err", "Check",
        name_w = name_w, col_w = col_w
    );
    println!("{}", "-".repeat(name_w + 8 + 7 + col_w * 4 + 6 + 7));

    for r in reports {
        let tile_str = format!("{}x{}", r.w1, r.w2);
        let median_str = match r.median_ms {
            Some(ms) => format!("{:.3}ms", ms),
            None => "N/A".to_string(),
        };
        let mean_str = match r.mean_ms {
            Some(ms) => format!("{:.3}ms", ms),
            None => "N/A".to_string(),
        };
        let rate_str = match r.gitems_per_sec() {
            Some(rate) => format!("{:.3}", rate),
            None => "N/A".to_string(),
        };
        let err_str = match r.err {
            Some(err) => format!("{:.2e}", err),
            None => "N/A".to_string(),
        };
        let check_str = match &r.outcome {
            Outcome::Passed => "\u{2713}",
            Outcome::Skipped { .. } => "\u{2717}",
        };

        println!(
            "{:<name_w$} {:>8} {:>7} {:>col_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>6}",
            bench_name(r), tile_str, r.iterations, median_str, mean_str, rate_str, err_str, check_str,
            name_w = name_w, col_w = col_w
        );
        if let Outcome::Skipped { reason, .. } = &r.outcome {
            println!("    skipped: {}", reason);
        }
    }
    println!();
}
