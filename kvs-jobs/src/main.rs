//! CLI entry point.
//!
//! ```bash
//! # Process every .job file in ./jobs with 4 workers and at most 2 backups in flight
//! cargo run --bin kvs-jobs -- ./jobs 4 2
//!
//! # More detail on stderr
//! RUST_LOG=kvs_jobs=debug cargo run --bin kvs-jobs -- ./jobs 4 2
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::error;

use kvs_jobs::config::{Args, Config};
use kvs_jobs::engine;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = Config::try_from(Args::parse())?;
    let summary = engine::run(&config)?;
    if summary.jobs.failed > 0 {
        error!(failed = summary.jobs.failed, "some jobs did not complete");
    }
    Ok(())
}
