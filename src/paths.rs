//! Path and environment resolution for convoy
//!
//! Everything a run reads or writes on the control node hangs off the
//! directory that holds the inventory file:
//!
//! ```text
//! <root>/inventory.yaml
//! <root>/convoy.toml                  optional settings
//! <root>/config.yaml                  optional, shipped to hosts as-is
//! <root>/templates/
//! <root>/data/                        raw files shipped to hosts
//! <root>/<data_path>/configs/         keys, other-*, networks-*, selectors
//! ```
//!
//! `data_path` comes from the inventory and defaults to `.`.
//!
//! # Environment Variables
//!
//! - `CONVOY_DRY_RUN` - `true` while a run must not change anything; set on
//!   the control node and forwarded to every host
//! - `CONVOY_OVERLAY` - `true` to reach servers over their overlay address;
//!   defaults to whether `/etc/wireguard` exists
//! - `CONVOY_DUMP_COMMAND` - echo the output of every helper command
//! - `CONVOY_CONTROL_DIR` - override the ssh ControlMaster socket directory

use anyhow::{Context, Result};
use declarative::{SELECTORS_CONFIG, network_config_name, other_config_name};
use std::path::{Component, Path, PathBuf};

pub const ENV_DRY_RUN: &str = "CONVOY_DRY_RUN";
pub const ENV_OVERLAY: &str = "CONVOY_OVERLAY";
pub const ENV_DUMP_COMMAND: &str = "CONVOY_DUMP_COMMAND";
pub const ENV_CONTROL_DIR: &str = "CONVOY_CONTROL_DIR";

/// Locations derived from the inventory path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    inventory_path: PathBuf,
    root: PathBuf,
    data_dir: PathBuf,
}

impl Workspace {
    pub fn from_inventory(path: &Path) -> Result<Self> {
        let absolute = std::path::absolute(expand(&path.to_string_lossy()))
            .with_context(|| format!("Failed to resolve inventory path: {}", path.display()))?;
        let inventory_path = normalize(&absolute);
        let root = inventory_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        log::debug!("Workspace root: {}", root.display());
        Ok(Self {
            inventory_path,
            data_dir: root.clone(),
            root,
        })
    }

    /// Apply the inventory's `data_path`
    pub fn with_data_path(mut self, data_path: &str) -> Self {
        self.data_dir = normalize(&self.root.join(expand(data_path)));
        self
    }

    pub fn inventory_path(&self) -> &Path {
        &self.inventory_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("configs")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    /// Raw files shipped to hosts
    pub fn data_files_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir().join(name)
    }

    /// `configs/other-<name>`
    pub fn other_config_file(&self, name: &str) -> PathBuf {
        self.config_file(&other_config_name(name))
    }

    /// `configs/networks-<name>`
    pub fn network_config_file(&self, name: &str) -> PathBuf {
        self.config_file(&network_config_name(name))
    }

    /// `configs/other-selectors.json`
    pub fn selectors_file(&self) -> PathBuf {
        self.other_config_file(SELECTORS_CONFIG)
    }

    /// Absolute path of an inventory `ssh_key`, resolved against `configs/`
    pub fn key_path(&self, key: &str) -> PathBuf {
        normalize(&self.config_dir().join(expand(key)))
    }
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Directory for ssh ControlMaster sockets
pub fn control_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CONTROL_DIR) {
        return expand(&dir);
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("convoy-ssh")
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Whether this process must not change anything
pub fn dry_run_enabled() -> bool {
    env_flag(ENV_DRY_RUN)
}

/// Whether servers are reached over the overlay network.
///
/// Defaults to on when the control node itself has a wireguard config.
pub fn overlay_enabled() -> bool {
    if std::env::var_os(ENV_OVERLAY).is_some() {
        return env_flag(ENV_OVERLAY);
    }
    Path::new("/etc/wireguard").exists()
}

/// Whether helper commands echo their output
pub fn dump_commands() -> bool {
    env_flag(ENV_DUMP_COMMAND)
}

/// Publish the dry-run flag to module helpers in this process.
///
/// Must be called before any threads are started.
pub fn export_dry_run(dry_run: bool) {
    // SAFETY: called from the entry points, before rayon or ssh threads exist
    unsafe { std::env::set_var(ENV_DRY_RUN, if dry_run { "true" } else { "false" }) };
}

// ============================================================================
// Tests
// ============================================================================
