//! Command implementations for the parmap CLI

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use super::OutputFormat;

pub mod config;
pub mod demo;
pub mod levels;

/// Render `value` in a structured format. `Text` is handled by each command.
pub(crate) fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json | OutputFormat::Text => {
            serde_json::to_string_pretty(value).context("Failed to serialize as JSON")
        }
        OutputFormat::Yaml => serde_yml::to_string(value).context("Failed to serialize as YAML"),
        OutputFormat::Toml => {
            let value = serde_json::to_value(value).context("Failed to serialize as TOML")?;
            toml::to_string_pretty(&toml_compatible(value)).context("Failed to serialize as TOML")
        }
    }
}

/// TOML has neither null nor integers above `i64::MAX`: drop the former and
/// write the latter as strings.
fn toml_compatible(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => Value::String(n.to_string()),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(toml_compatible)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, item)| !item.is_null())
                .map(|(key, item)| (key, toml_compatible(item)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_toml_renders_large_seeds_and_skips_nulls() {
        let summary = json!({
            "mode": "socket",
            "seed": u64::MAX,
            "level": null,
            "workers": 2,
        });

        let rendered = render(&summary, OutputFormat::Toml).unwrap();
        assert!(rendered.contains("seed = \"18446744073709551615\""));
        assert!(rendered.contains("workers = 2"));
        assert!(!rendered.contains("level"));
    }
}
