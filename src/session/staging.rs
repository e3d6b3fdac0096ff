//! Pending exports, libraries and sources
//!
//! Items staged while a parallel session is running wait here until the next
//! eligible dispatch. Flushing is all-or-nothing: [`StagingSet::prepare`]
//! resolves every item first (sources are read, libraries loaded on the
//! master) and only then hands a [`StagedResources`] batch to the backend.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result, StagedKind};
use crate::parallel::{SharedValue, StagedResources};

/// Loads a named library into the master process before it is pushed to
/// workers. Failing here aborts the dispatch with a staging error.
pub trait LibraryLoader: Send + Sync {
    fn load(&self, name: &str) -> anyhow::Result<()>;
}

/// Loader that accepts every library name.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl LibraryLoader for AcceptAll {
    fn load(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> LibraryLoader for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn load(&self, name: &str) -> anyhow::Result<()> {
        self(name)
    }
}

#[derive(Clone, Default)]
pub struct StagingSet {
    exports: Vec<(String, SharedValue)>,
    libraries: Vec<String>,
    sources: Vec<PathBuf>,
}

impl StagingSet {
    /// Stage an export. Re-staging a name replaces the pending value in place.
    pub fn export(&mut self, name: impl Into<String>, value: SharedValue) {
        let name = name.into();
        match self.exports.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.exports.push((name, value)),
        }
    }

    pub fn library(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.libraries.contains(&name) {
            self.libraries.push(name);
        }
    }

    pub fn source(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.sources.contains(&path) {
            self.sources.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty() && self.libraries.is_empty() && self.sources.is_empty()
    }

    pub fn export_names(&self) -> Vec<&str> {
        self.exports.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Take every pending item, leaving the set empty.
    pub fn take(&mut self) -> StagingSet {
        std::mem::take(self)
    }

    /// Put items back after a failed flush. Items staged in the meantime win.
    pub fn restore(&mut self, previous: StagingSet) {
        let newer = std::mem::replace(self, previous);
        for (name, value) in newer.exports {
            self.export(name, value);
        }
        for library in newer.libraries {
            self.library(library);
        }
        for source in newer.sources {
            self.source(source);
        }
    }

    /// Resolve every pending item into a batch ready to push.
    pub fn prepare(&self, loader: &dyn LibraryLoader) -> Result<StagedResources> {
        let mut sources = Vec::with_capacity(self.sources.len());
        for path in &self.sources {
            let content = fs::read_to_string(path).map_err(|e| Error::Staging {
                kind: StagedKind::Source,
                name: path.display().to_string(),
                message: e.to_string(),
            })?;
            sources.push((path.clone(), Arc::<str>::from(content)));
        }

        for library in &self.libraries {
            loader.load(library).map_err(|e| Error::Staging {
                kind: StagedKind::Library,
                name: library.clone(),
                message: format!("{:#}", e),
            })?;
        }

        Ok(StagedResources {
            exports: self.exports.clone(),
            libraries: self.libraries.clone(),
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_overwrites_in_place() {
        let mut staging = StagingSet::default();
        staging.export("a", Arc::new(1_i32));
        staging.export("b", Arc::new(2_i32));
        staging.export("a", Arc::new(3_i32));

        assert_eq!(staging.export_names(), vec!["a", "b"]);
        let prepared = staging.prepare(&AcceptAll).unwrap();
        assert_eq!(prepared.exports[0].1.downcast_ref::<i32>(), Some(&3));
    }

    #[test]
    fn test_libraries_and_sources_dedupe() {
        let mut staging = StagingSet::default();
        staging.library("stats");
        staging.library("stats");
        staging.source("a.R");
        staging.source("a.R");
        assert_eq!(staging.libraries().len(), 1);
        assert_eq!(staging.sources().len(), 1);
    }

    #[test]
    fn test_take_and_restore() {
        let mut staging = StagingSet::default();
        staging.export("a", Arc::new(1_i32));
        let taken = staging.take();
        assert!(staging.is_empty());

        staging.export("a", Arc::new(2_i32));
        staging.library("late");
        staging.restore(taken);

        assert_eq!(staging.export_names(), vec!["a"]);
        assert_eq!(staging.libraries(), ["late".to_string()]);
        let prepared = staging.prepare(&AcceptAll).unwrap();
        assert_eq!(prepared.exports[0].1.downcast_ref::<i32>(), Some(&2));
    }

    #[test]
    fn test_missing_source_is_staging_error() {
        let mut staging = StagingSet::default();
        staging.source("/definitely/not/here.R");
        let err = staging.prepare(&AcceptAll).unwrap_err();
        assert!(matches!(
            err,
            Error::Staging {
                kind: StagedKind::Source,
                ..
            }
        ));
    }

    #[test]
    fn test_source_content_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helpers.R");
        fs::write(&path, "f <- function(x) x").unwrap();

        let mut staging = StagingSet::default();
        staging.source(&path);
        let prepared = staging.prepare(&AcceptAll).unwrap();
        assert_eq!(prepared.sources[0].1.as_ref(), "f <- function(x) x");
    }

    #[test]
    fn test_loader_failure_is_staging_error() {
        let loader = |name: &str| -> anyhow::Result<()> {
            if name == "missing" {
                anyhow::bail!("there is no package called '{}'", name);
            }
            Ok(())
        };

        let mut staging = StagingSet::default();
        staging.library("stats");
        assert!(staging.prepare(&loader).is_ok());

        staging.library("missing");
        let err = staging.prepare(&loader).unwrap_err();
        assert!(err.to_string().contains("there is no package called 'missing'"));
    }
}
