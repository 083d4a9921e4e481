use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fetchcache::Config;

use crate::logging::init;
use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
#[command(about = "Runs synthetic workloads against the cache registry")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Logs through the configured logger instead of discarding all output.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: `init` modifies the environment, no other threads are running yet.
    let guard = unsafe {
        init(logging::Options {
            config: &config,
            verbose: cli.verbose,
        })
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fetchcache-stress")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async move {
        let _metrics_sink = guard.udp_sink.map(tokio::spawn);

        perform_stresstest(config, workloads, cli.duration).await
    })
}
