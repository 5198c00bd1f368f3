//! # traffic-bandit: run-once weight update job
//!
//! Reads the job configuration, fetches the batch, recalculates weights for
//! every configured page type, and (with `--update`) publishes them.
//!
//! ## Usage
//!
//! ```bash
//! # Compute and log weights without touching the store
//! traffic-bandit --config bandit.toml
//!
//! # Publish, and leave metrics for the node exporter
//! traffic-bandit --config bandit.toml --update --metrics-out /var/lib/node_exporter/bandit.prom
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use traffic_bandit::config::{export_schema, loader};
use traffic_bandit::{init_tracing, metrics, run_once, ElasticWeightStore, WeightSink};

/// Parsed CLI arguments.
#[derive(Debug, PartialEq)]
struct Args {
    /// Path to the job TOML file.
    config: PathBuf,
    /// Publish weights instead of only logging them.
    update: bool,
    /// Where to write the Prometheus text dump after the run.
    metrics_out: Option<PathBuf>,
    /// Print the config JSON Schema and exit.
    print_schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// `Err` carries the message to print; `--help` yields the usage text.
fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut config = PathBuf::from("bandit.toml");
    let mut update = false;
    let mut metrics_out = None;
    let mut print_schema = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = PathBuf::from(&args[i]);
            }
            "--update" => {
                update = true;
            }
            "--metrics-out" => {
                i += 1;
                if i >= args.len() {
                    return Err("--metrics-out requires a value".to_string());
                }
                metrics_out = Some(PathBuf::from(&args[i]));
            }
            "--print-schema" => {
                print_schema = true;
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{}", usage()));
            }
        }
        i += 1;
    }

    Ok(Args {
        config,
        update,
        metrics_out,
        print_schema,
    })
}

/// Usage text.
fn usage() -> String {
    [
        "Usage: traffic-bandit [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>     Job configuration (default: bandit.toml)",
        "  --update                Publish weights (default: dry run)",
        "  --metrics-out <FILE>    Write Prometheus metrics to FILE after the run",
        "  --print-schema          Print the configuration JSON Schema and exit",
        "  --help, -h              Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() {
    let _ = init_tracing();

    let raw: Vec<String> = std::env::args().collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    if args.print_schema {
        match export_schema() {
            Ok(schema) => println!("{schema}"),
            Err(e) => {
                eprintln!("Failed to export schema: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match loader::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, config = %args.config.display(), "configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "metrics disabled");
    }

    let sink: Arc<dyn WeightSink> = Arc::new(ElasticWeightStore::new(config.storage.clone()));
    let source = config.batch_source();

    info!(
        config = %args.config.display(),
        policy = config.bandit.policy.name(),
        dry_run = !args.update,
        "starting bandit update"
    );

    let outcome = run_once(&config, &source, sink, !args.update).await;

    if let Some(path) = &args.metrics_out {
        if let Err(e) = std::fs::write(path, metrics::gather_metrics()) {
            error!(error = %e, path = %path.display(), "cannot write metrics");
        }
    }

    match outcome {
        Ok(report) => {
            for page in report.pages() {
                info!(
                    page_type = %page.page_type,
                    outcome = page.state.outcome(),
                    weights = ?page.weights,
                    "page type result"
                );
            }
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "run aborted");
            std::process::exit(1);
        }
    }
}
