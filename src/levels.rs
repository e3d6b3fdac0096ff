//! Level registry
//!
//! Libraries tag their mapping calls with a level such as `mlr.resample` and
//! register the levels they use under their own name. Applications then pick
//! the one level that should run in parallel. The registry is append-only for
//! the life of the process and is only consulted for display and for the
//! non-fatal "unregistered level" warning at session start.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<LevelRegistry> = Arc::new(LevelRegistry::new());
}

/// A registered level, identified as `owner.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level {
    owner: String,
    name: String,
}

impl Level {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified identifier used to tag mapping calls.
    pub fn id(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

type Owners = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Default)]
pub struct LevelRegistry {
    owners: RwLock<Owners>,
}

impl LevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> Arc<LevelRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Register `levels` under `owner`. Registering a level twice is a no-op.
    pub fn register<I, S>(&self, owner: &str, levels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
        let entry = owners.entry(owner.to_string()).or_default();
        for level in levels {
            let level = level.into();
            if entry.insert(level.clone()) {
                tracing::debug!("Registered level {}.{}", owner, level);
            }
        }
    }

    /// Whether a qualified level identifier (`owner.name`) is registered.
    pub fn contains(&self, level: &str) -> bool {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners.iter().any(|(owner, names)| {
            level
                .strip_prefix(owner.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|name| names.contains(name))
        })
    }

    /// Snapshot of every registered level, grouped by owner.
    pub fn list(&self) -> RegisteredLevels {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        RegisteredLevels {
            owners: Arc::new(owners.clone()),
        }
    }
}

/// Immutable snapshot of the registry.
///
/// Iteration is lazy and can be restarted any number of times.
#[derive(Debug, Clone)]
pub struct RegisteredLevels {
    owners: Arc<Owners>,
}

impl RegisteredLevels {
    /// All levels, grouped by owner in lexical order.
    pub fn iter(&self) -> impl Iterator<Item = Level> + '_ {
        self.owners
            .iter()
            .flat_map(|(owner, names)| names.iter().map(move |name| Level::new(owner, name)))
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> + '_ {
        self.owners
            .iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(owner, _)| owner.as_str())
    }

    pub fn levels_of<'a>(&'a self, owner: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.owners
            .get(owner)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    /// Qualified identifiers of every level.
    pub fn flatten(&self) -> Vec<String> {
        self.iter().map(|level| level.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.owners.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> IntoIterator for &'a RegisteredLevels {
    type Item = Level;
    type IntoIter = Box<dyn Iterator<Item = Level> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
