use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;

use super::render;
use crate::cli::{Output, OutputFormat};
use parmap::OptionStore;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Display the merged options from every layer
    Show,
    /// Check that the merged options describe a valid session
    Validate,
}

pub fn execute(
    args: ConfigArgs,
    custom_config: Option<&str>,
    format: OutputFormat,
    output: &Output,
) -> Result<()> {
    let store = OptionStore::load_with(custom_config.map(Path::new), None)
        .context("Failed to load configuration")?;

    match args.command {
        ConfigCommand::Show => show(&store, format, output),
        ConfigCommand::Validate => validate(&store, format, output),
    }
}

fn show(store: &OptionStore, format: OutputFormat, output: &Output) -> Result<()> {
    let value = store.to_value()?;

    if format != OutputFormat::Text {
        println!("{}", render(&value, format)?);
        return Ok(());
    }

    output.header("Resolved options");
    if let Some(options) = value.as_object() {
        for (key, value) in options {
            let shown = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            output.table_row(key, &shown);
        }
    }
    Ok(())
}

fn validate(store: &OptionStore, format: OutputFormat, output: &Output) -> Result<()> {
    let config = match store.session_config() {
        Ok(config) => config,
        Err(e) => {
            output.error("Configuration is invalid");
            return Err(e).context("Configuration is invalid");
        }
    };

    let summary = json!({
        "valid": true,
        "mode": config.mode(),
        "level": config.level(),
        "logging": config.logging(),
        "storage_dir": config.storage_dir(),
        "load_balancing": config.load_balancing(),
        "reproducible": config.is_reproducible(),
    });

    if format != OutputFormat::Text {
        println!("{}", render(&summary, format)?);
        return Ok(());
    }

    output.success("Configuration is valid");
    output.table_row("Mode", config.mode().as_str());
    output.table_row("Level", config.level().unwrap_or("none"));
    output.table_row("Logging", &config.logging().to_string());
    output.table_row("Storage dir", &config.storage_dir().display().to_string());
    output.table_row("Load balancing", &config.load_balancing().to_string());
    output.table_row("Reproducible", &config.is_reproducible().to_string());
    Ok(())
}
