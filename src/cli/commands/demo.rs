use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use rand::Rng;
use serde::Serialize;

use super::render;
use crate::cli::{DEMO_LEVEL, Output, OutputFormat};
use parmap::{Mode, OptionStore, ParallelOptions};

#[derive(Args)]
pub struct DemoArgs {
    /// Backend to run on (overrides configuration)
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Number of workers, or maximum concurrent jobs in batchqueue mode
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Socket worker hosts, one worker per entry
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Number of elements to map over
    #[arg(long, default_value_t = 10)]
    pub count: u64,

    /// Master seed; makes the run reproducible
    #[arg(long)]
    pub seed: Option<u64>,

    /// Only parallelize calls tagged with this level
    #[arg(long)]
    pub level: Option<String>,

    /// Level the demo call is tagged with
    #[arg(long, default_value = DEMO_LEVEL)]
    pub tag: String,

    /// Write per-task log files under the storage directory
    #[arg(long)]
    pub logging: bool,

    /// Directory for log files and batch registries
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Hand out tasks one at a time instead of pre-scheduling them
    #[arg(long)]
    pub load_balancing: bool,
}

impl DemoArgs {
    fn explicit_options(&self) -> ParallelOptions {
        ParallelOptions {
            mode: self.mode,
            cpus: self.cpus,
            socket_hosts: (!self.hosts.is_empty()).then(|| self.hosts.clone()),
            level: self.level.clone(),
            logging: self.logging.then_some(true),
            storage_dir: self.storage_dir.clone(),
            load_balancing: self.load_balancing.then_some(true),
            reproducible: self.seed.map(|_| true),
            seed: self.seed,
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct DemoSummary {
    mode: Mode,
    workers: usize,
    seed: Option<u64>,
    parallel: bool,
    results: Vec<u64>,
}

pub fn execute(
    args: DemoArgs,
    custom_config: Option<&str>,
    format: OutputFormat,
    output: &Output,
) -> Result<()> {
    let store = OptionStore::load_with(custom_config.map(Path::new), Some(&args.explicit_options()))
        .context("Failed to load configuration")?;
    let config = store
        .session_config()
        .context("Invalid demo configuration")?;

    let dispatcher = parmap::global();
    let report = dispatcher.start(config).context("Failed to start parallelization")?;
    for warning in &report.warnings {
        output.warning(&warning.to_string());
    }

    dispatcher.stage_export("scale", 10_u64);
    let mapped = dispatcher.map(
        |ctx, i: u64| {
            let scale = *ctx.require::<u64>("scale")?;
            let noise = ctx.rng().gen_range(0..10_u64);
            ctx.log(format_args!("element {} drew {}", i, noise))?;
            Ok(i * scale + noise)
        },
        1..=args.count,
        Some(args.tag.as_str()),
    );
    let parallel = dispatcher
        .backend_stats()
        .is_some_and(|stats| stats.dispatches > 0);
    dispatcher.stop();

    let summary = DemoSummary {
        mode: report.mode,
        workers: report.workers,
        seed: report.seed,
        parallel,
        results: mapped.context("Demo workload failed")?,
    };

    if format != OutputFormat::Text {
        println!("{}", render(&summary, format)?);
        return Ok(());
    }

    output.header("Demo run");
    output.table_row("Mode", summary.mode.as_str());
    output.table_row("Workers", &summary.workers.to_string());
    if let Some(seed) = summary.seed {
        output.table_row("Seed", &seed.to_string());
    }
    output.table_row("Parallel", &summary.parallel.to_string());
    output.table_row(
        "Results",
        &summary
            .results
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    );
    if !summary.parallel {
        output.indent(&format!(
            "Call tagged '{}' ran sequentially; check the active level.",
            args.tag
        ));
    }
    Ok(())
}
