//! Command-line interface for parmap
//!
//! Inspect the layered options, list registered levels and run a small demo
//! workload on any backend.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};

pub mod commands;
mod output;

pub use output::Output;

/// Level the demo workload tags its calls with.
pub const DEMO_LEVEL: &str = "parmap.demo";

/// parmap - mode-agnostic parallel map
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (toml, json or yaml)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// Increase verbosity (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
    Toml,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and validate the resolved options
    Config(commands::config::ConfigArgs),
    /// List registered levels
    Levels(commands::levels::LevelsArgs),
    /// Run a demo workload through a parallel session
    Demo(commands::demo::DemoArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        setup_logging(self.verbose, self.quiet);
        parmap::register_levels("parmap", ["demo"]);

        let output = Output::new(self.verbose > 0, self.quiet);
        let config = self.config.as_deref();

        match self.command {
            Some(Commands::Config(args)) => commands::config::execute(args, config, self.format, &output),
            Some(Commands::Levels(args)) => commands::levels::execute(args, self.format, &output),
            Some(Commands::Demo(args)) => commands::demo::execute(args, config, self.format, &output),
            None => {
                let mut cmd = Cli::command();
                cmd.print_help()?;
                Ok(())
            }
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => tracing_subscriber::EnvFilter::new("warn"),
        1 => tracing_subscriber::EnvFilter::new("info"),
        2 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
