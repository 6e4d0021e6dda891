mod config;
mod harness;
mod sweep;

use std::path::Path;
use tilebench::Device;
use tilebench_types::{SweepSpec, Variant};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn print_usage() {
    eprintln!("Usage: benchmarks [OPTIONS]");
    eprintln!();
    eprintln!("  --config <path>      Sweep config (JSON); flags below override it");
    eprintln!("  --variant <name>     Kernel variant: global, local, all (default: all)");
    eprintln!("  --rows <list>        Grid rows, comma separated (default: 4096,8192)");
    eprintln!("  --cols <list>        Grid columns, comma separated (default: 128)");
    eprintln!("  --tile-rows <list>   Tile rows; tile cols = capacity / tile rows (default: 1)");
    eprintln!("  --capacity <n>       Work items per workgroup (default: 128)");
    eprintln!("  --iterations <n>     Timed iterations per configuration (default: 10)");
    eprintln!("  --warmup <n>         Untimed iterations before timing (default: 1)");
    eprintln!("  --tolerance <x>      Largest accepted L1 error (default: 1e-5)");
    eprintln!("  --units <n>          Compute units (default: auto, or {})", config::COMPUTE_UNITS_ENV);
    eprintln!("  --json <path|->      Also write reports as JSON");
    eprintln!("  --help               Show this help");
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{}", msg);
    print_usage();
    std::process::exit(1);
}

fn number_arg<T: std::str::FromStr>(flag: &str, raw: &str) -> T {
    config::parse_number(raw).unwrap_or_else(|| usage_error(&format!("bad {}: {}", flag, raw)))
}

fn main() {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("off")),
                ),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut spec = SweepSpec::default();
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        match args.get(pos + 1) {
            Some(path) => {
                spec = config::load_sweep(Path::new(path)).unwrap_or_else(|e| usage_error(&e));
            }
            None => usage_error("--config needs a path"),
        }
    }
    config::apply_env(&mut spec);

    let mut json: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .cloned()
                .unwrap_or_else(|| usage_error(&format!("{} needs a value", flag)))
        };
        match flag {
            "--config" => {
                i += 1;
            }
            "--variant" => {
                spec.variants = match value().as_str() {
                    "global" => vec![Variant::Global],
                    "local" => vec![Variant::Local],
                    "all" => vec![Variant::Global, Variant::Local],
                    other => usage_error(&format!("Unknown variant: {}", other)),
                };
                i += 1;
            }
            "--rows" => {
                spec.rows = config::parse_list(&value()).unwrap_or_else(|| usage_error("bad --rows"));
                i += 1;
            }
            "--cols" => {
                spec.cols = config::parse_list(&value()).unwrap_or_else(|| usage_error("bad --cols"));
                i += 1;
            }
            "--tile-rows" => {
                spec.tile_rows =
                    config::parse_list(&value()).unwrap_or_else(|| usage_error("bad --tile-rows"));
                i += 1;
            }
            "--capacity" => {
                spec.workgroup_capacity = number_arg(flag, &value());
                i += 1;
            }
            "--iterations" => {
                spec.iterations = number_arg(flag, &value());
                i += 1;
            }
            "--warmup" => {
                spec.warmup = number_arg(flag, &value());
                i += 1;
            }
            "--tolerance" => {
                spec.tolerance = number_arg(flag, &value());
                i += 1;
            }
            "--units" => {
                spec.device.compute_units = number_arg(flag, &value());
                i += 1;
            }
            "--json" => {
                json = Some(value());
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => usage_error(&format!("Unknown flag: {}", other)),
        }
        i += 1;
    }

    let device = match Device::new(spec.device.clone()) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Device initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    eprintln!(
        "\n=== Scratch tier sweep: {} configurations on {} compute units ===",
        sweep::configurations(&spec).len(),
        spec.device.compute_units
    );
    let reports = sweep::run_sweep(&device, &spec);
    harness::print_table(&reports);

    if let Some(dest) = json {
        if let Err(e) = config::write_json(&dest, &reports) {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
