//! Persisted role selections (`configs/other-selectors.json`)

use crate::fsutil;
use anyhow::{Context, Result};
use declarative::selector::{self, Choice};
use declarative::{RoleResolver, SelectorSink, Selections, ServerRecord};
use std::fs;
use std::path::{Path, PathBuf};

/// Role decisions on the control node.
///
/// Decisions survive across runs in a JSON file with sorted keys. In a dry
/// run new decisions are kept in memory only.
#[derive(Debug)]
pub struct SelectorStore {
    path: PathBuf,
    dry_run: bool,
    selections: Selections,
}

impl SelectorStore {
    /// Open the store, reading existing decisions if the file exists
    pub fn open(path: impl Into<PathBuf>, dry_run: bool) -> Result<Self> {
        let path = path.into();
        let selections = read_selections(&path)?;
        log::debug!(
            "Loaded {} selector decision(s) from {}",
            selections.len(),
            path.display()
        );
        Ok(Self {
            path,
            dry_run,
            selections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn selections(&self) -> &Selections {
        &self.selections
    }

    /// Server for `role`, recording a fresh decision
    pub fn resolve(&mut self, role: &str, servers: &[ServerRecord]) -> Result<ServerRecord> {
        let choice = selector::choose(role, servers, &self.selections)?;
        let server = choice.server().clone();
        if let Choice::Fresh(_) = choice {
            let mut decision = Selections::new();
            decision.insert(role.to_string(), server.name.clone());
            self.merge(&decision)?;
        }
        Ok(server)
    }

    /// Merge `decisions` into the file, re-reading it first
    pub fn merge(&mut self, decisions: &Selections) -> Result<()> {
        let mut merged = read_selections(&self.path)?;
        merged.extend(self.selections.clone());
        merged.extend(decisions.clone());
        self.selections = merged;

        let value = serde_json::to_value(&self.selections)?;
        fsutil::set_json_contents(&self.path, &value, self.dry_run)?;
        Ok(())
    }
}

impl SelectorSink for SelectorStore {
    fn record(&mut self, decisions: &Selections) -> Result<()> {
        self.merge(decisions)
    }
}

impl RoleResolver for SelectorStore {
    fn resolve_role(&mut self, role: &str, servers: &[ServerRecord]) -> Result<ServerRecord> {
        self.resolve(role, servers)
    }
}

fn read_selections(path: &Path) -> Result<Selections> {
    if !path.exists() {
        return Ok(Selections::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid selector file format in {}", path.display()))
}
