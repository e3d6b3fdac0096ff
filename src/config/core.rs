use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};

use super::{ParallelOptions, SessionConfig, overrides, smart_load};
use crate::error::{Error, Result};

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

/// Layered option store
///
/// Priority, lowest first:
/// 1. Built-in defaults (`default-config.toml`)
/// 2. User config (`$HOME/.config/parmap/config.{toml,json,yaml}`)
/// 3. Repository config (`parmap.{toml,json,yaml,yml}` in the working directory)
/// 4. Custom config file, if given
/// 5. `PARMAP_*` environment variables
/// 6. Explicit arguments
pub struct OptionStore {
    figment: Figment,
}

impl OptionStore {
    pub fn load() -> Result<Self> {
        Self::load_with(None, None)
    }

    pub fn load_with(custom_config: Option<&Path>, explicit: Option<&ParallelOptions>) -> Result<Self> {
        tracing::trace!("CONFIG LOAD: Starting");

        let user_config = Self::user_config_path();
        let mut figment = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG))
            .merge(Toml::file(user_config.with_extension("toml")))
            .merge(Json::file(user_config.with_extension("json")))
            .merge(Yaml::file(user_config.with_extension("yaml")))
            .merge(Toml::file("parmap.toml"))
            .merge(Json::file("parmap.json"))
            .merge(Yaml::file("parmap.yaml"))
            .merge(Yaml::file("parmap.yml"));

        if let Some(path) = custom_config {
            if !path.exists() {
                return Err(Error::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            tracing::trace!("CONFIG LOAD: Custom config {}", path.display());
            figment = figment.merge(smart_load::auto(path));
        }

        figment = figment.merge(Env::prefixed("PARMAP_"));

        if let Some(explicit) = explicit {
            tracing::trace!("CONFIG LOAD: Applying explicit overrides");
            figment = figment.merge(Serialized::defaults(overrides::strip_unset(explicit)));
        }

        Ok(OptionStore { figment })
    }

    /// Fully resolved options.
    pub fn options(&self) -> Result<ParallelOptions> {
        self.figment
            .extract()
            .map_err(|e| Error::config(format!("invalid options: {}", e)))
    }

    /// Resolved options validated into a session configuration.
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.options()?.into_session_config()
    }

    /// Full merged configuration as a structured value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        self.figment
            .extract()
            .map_err(|e| Error::config(format!("invalid options: {}", e)))
    }

    fn user_config_path() -> PathBuf {
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".config/parmap/config"),
            Err(_) => PathBuf::from("~/.config/parmap/config"),
        }
    }
}
