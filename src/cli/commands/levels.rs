use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::render;
use crate::cli::{Output, OutputFormat};
use parmap::LevelRegistry;

#[derive(Args)]
pub struct LevelsArgs {
    /// Only list levels registered by this owner
    #[arg(long)]
    pub owner: Option<String>,
}

pub fn execute(args: LevelsArgs, format: OutputFormat, output: &Output) -> Result<()> {
    let levels = LevelRegistry::global().list();
    let selected: Vec<_> = levels
        .iter()
        .filter(|level| args.owner.as_deref().is_none_or(|owner| level.owner() == owner))
        .collect();

    if format != OutputFormat::Text {
        let ids: Vec<String> = selected.iter().map(|level| level.id()).collect();
        println!("{}", render(&json!({ "levels": ids }), format)?);
        return Ok(());
    }

    if selected.is_empty() {
        output.info("No levels registered");
        return Ok(());
    }

    let mut current_owner: Option<&str> = None;
    for level in &selected {
        if current_owner != Some(level.owner()) {
            output.section_header(level.owner());
            current_owner = Some(level.owner());
        }
        output.list_item(&level.id());
    }
    output.verbose(&format!("{} level(s)", selected.len()));
    Ok(())
}
