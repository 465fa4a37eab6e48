use crate::paths::Workspace;
use anyhow::{Context, Result};
use declarative::{HostBundle, Inventory, ServerRecord};
use serde::{Deserialize, Serialize};
use sshkit::{RetryConfig, SessionOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Optional settings file next to the inventory
pub const SETTINGS_FILE: &str = "convoy.toml";

/// Optional free-form config shipped to every host under its own name
pub const EXTRA_CONFIG_FILE: &str = "config.yaml";

/// Agent directory on hosts; ssh starts commands in the login user's home
pub const DEFAULT_AGENT_DIR: &str = ".cache/convoy";

// ============================================================================
// Inventory
// ============================================================================

/// Load and check the inventory document
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read inventory {}", path.display()))?;
    let inventory: Inventory = serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid inventory format in {}", path.display()))?;

    let mut seen = BTreeSet::new();
    for server in &inventory.servers {
        if !seen.insert(server.name.as_str()) {
            anyhow::bail!("Duplicate server name in inventory: {}", server.name);
        }
    }
    log::debug!(
        "Loaded {} server(s) for environment '{}'",
        inventory.servers.len(),
        inventory.environment
    );
    Ok(inventory)
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ssh: SshSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Connection attempts for resets during negotiation
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    /// Reuse one connection per host through ControlMaster
    pub multiplex: bool,
    pub control_persist_secs: u64,
    /// Where the agent binary is stored on hosts, relative to the login
    /// user's home unless absolute
    pub agent_dir: String,
    /// Hosts contacted at once; all of a batch by default
    pub jobs: Option<usize>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 1000,
            connect_timeout_secs: 10,
            multiplex: true,
            control_persist_secs: 60,
            agent_dir: DEFAULT_AGENT_DIR.to_string(),
            jobs: None,
        }
    }
}

impl Settings {
    /// Load `convoy.toml` from the workspace root, defaults when absent
    pub fn load(workspace: &Workspace) -> Result<Self> {
        let path = workspace.root().join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid {SETTINGS_FILE} format"))
    }

    pub fn session_options(&self, control_dir: PathBuf) -> SessionOptions {
        SessionOptions {
            control_dir: self.ssh.multiplex.then_some(control_dir),
            control_persist: Duration::from_secs(self.ssh.control_persist_secs),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            retry: RetryConfig::new(
                self.ssh.attempts.max(1),
                Duration::from_millis(self.ssh.retry_delay_ms),
                2.0,
            ),
            ..SessionOptions::default()
        }
    }
}

// ============================================================================
// Host bundle
// ============================================================================

/// Files shipped to hosts, read once per batch
#[derive(Debug, Clone, Default)]
pub struct BundleSources {
    pub configs: BTreeMap<String, String>,
    pub templates: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl BundleSources {
    /// Read configs, templates and data for `inventory`.
    ///
    /// SSH keys named by the inventory stay on the control node.
    pub fn collect(workspace: &Workspace, inventory: &Inventory) -> Result<Self> {
        let keys: BTreeSet<PathBuf> = inventory
            .servers
            .iter()
            .filter(|s| !s.ssh_key.is_empty())
            .map(|s| workspace.key_path(&s.ssh_key))
            .collect();

        let mut configs = BTreeMap::new();
        for (relative, path) in walk_files(&workspace.config_dir()) {
            if keys.contains(&path) {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(text) => {
                    configs.insert(format!("configs/{relative}"), text);
                }
                Err(e) => log::warn!("Skipping unreadable config {}: {e}", path.display()),
            }
        }

        let extra = workspace.root().join(EXTRA_CONFIG_FILE);
        if extra.is_file() {
            let text = fs::read_to_string(&extra)
                .with_context(|| format!("Could not read {}", extra.display()))?;
            configs.insert(EXTRA_CONFIG_FILE.to_string(), text);
        }

        let mut templates = BTreeMap::new();
        for (relative, path) in walk_files(&workspace.templates_dir()) {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Could not read template {}", path.display()))?;
            templates.insert(relative, text);
        }

        let mut data = BTreeMap::new();
        for (relative, path) in walk_files(&workspace.data_files_dir()) {
            let bytes = fs::read(&path)
                .with_context(|| format!("Could not read data file {}", path.display()))?;
            data.insert(relative, bytes);
        }

        log::debug!(
            "Bundle: {} config(s), {} template(s), {} data file(s)",
            configs.len(),
            templates.len(),
            data.len()
        );
        Ok(Self {
            configs,
            templates,
            data,
        })
    }

    /// The bundle for one server
    pub fn bundle_for(&self, server: &ServerRecord, inventory: &Inventory) -> HostBundle {
        HostBundle {
            host: Some(server.clone()),
            inventory: inventory.clone(),
            environment: inventory.environment.clone(),
            configs: self.configs.clone(),
            templates: self.templates.clone(),
            data: self.data.clone(),
        }
    }
}

/// Regular, non-hidden files under `dir` as (relative path, absolute path)
fn walk_files(dir: &Path) -> Vec<(String, PathBuf)> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(dir).ok()?.to_string_lossy().to_string();
            Some((relative, e.path().to_path_buf()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace_with(inventory: &str) -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.yaml");
        fs::write(&path, inventory).unwrap();
        let parsed = load_inventory(&path).unwrap();
        let ws = Workspace::from_inventory(&path)
            .unwrap()
            .with_data_path(&parsed.data_path);
        (dir, ws)
    }

    #[test]
    fn test_load_inventory() {
        let (_dir, ws) = workspace_with(
            "environment: staging\nservers:\n  - name: foo\n    ssh_hostname: 10.0.0.1\n    ssh_key: id_foo\n    roles: [db]\n  - name: bar\n    ssh_port: 2222\n    ssh_user: admin\n",
        );
        let inventory = load_inventory(ws.inventory_path()).unwrap();
        assert_eq!(inventory.environment, "staging");
        assert_eq!(inventory.servers.len(), 2);
        assert_eq!(inventory.servers[0].ssh_port, 22);
        assert_eq!(inventory.servers[1].ssh_port, 2222);
        assert_eq!(inventory.servers[1].ssh_user, "admin");
        assert!(inventory.servers[0].attribute("roles").is_some());
    }

    #[test]
    fn test_load_inventory_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.yaml");
        fs::write(&path, "servers:\n  - name: foo\n  - name: foo\n").unwrap();
        let err = load_inventory(&path).unwrap_err();
        assert!(err.to_string().contains("Duplicate server name"));
    }

    #[test]
    fn test_load_inventory_missing_file() {
        let err = load_inventory(Path::new("/nonexistent/inventory.yaml")).unwrap_err();
        assert!(err.to_string().contains("Could not read inventory"));
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let (_dir, ws) = workspace_with("servers: []\n");
        let settings = Settings::load(&ws).unwrap();
        assert_eq!(settings, Settings::default());

        fs::write(
            ws.root().join(SETTINGS_FILE),
            "[ssh]\nattempts = 5\nmultiplex = false\n",
        )
        .unwrap();
        let settings = Settings::load(&ws).unwrap();
        assert_eq!(settings.ssh.attempts, 5);
        assert_eq!(settings.ssh.connect_timeout_secs, 10);
        assert_eq!(settings.ssh.agent_dir, ".cache/convoy");

        let options = settings.session_options(PathBuf::from("/run/x"));
        assert!(options.control_dir.is_none());
        assert_eq!(options.retry.max_attempts, 5);
    }

    #[test]
    fn test_bundle_sources_skip_keys_and_hidden() {
        let (_dir, ws) =
            workspace_with("data_path: site\nservers:\n  - name: foo\n    ssh_key: id_foo\n");
        let inventory = load_inventory(ws.inventory_path()).unwrap();

        assert_eq!(ws.config_dir(), ws.root().join("site/configs"));
        fs::create_dir_all(ws.config_dir().join("nested")).unwrap();
        fs::write(ws.config_file("id_foo"), "PRIVATE").unwrap();
        fs::write(ws.config_file(".hidden"), "x").unwrap();
        fs::write(ws.other_config_file("foo"), "{}").unwrap();
        fs::write(ws.config_dir().join("nested/app.conf"), "a=1").unwrap();
        fs::write(ws.root().join(EXTRA_CONFIG_FILE), "extra: true\n").unwrap();
        fs::create_dir_all(ws.templates_dir()).unwrap();
        fs::write(ws.templates_dir().join("motd"), "hi {{ name }}").unwrap();
        fs::create_dir_all(ws.data_files_dir()).unwrap();
        fs::write(ws.data_files_dir().join("blob.bin"), [0u8, 1, 2]).unwrap();

        let sources = BundleSources::collect(&ws, &inventory).unwrap();
        let keys: Vec<_> = sources.configs.keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["config.yaml", "configs/nested/app.conf", "configs/other-foo"]
        );
        assert_eq!(sources.templates["motd"], "hi {{ name }}");
        assert_eq!(sources.data["blob.bin"], vec![0u8, 1, 2]);

        let bundle = sources.bundle_for(&inventory.servers[0], &inventory);
        assert_eq!(bundle.host.as_ref().unwrap().name, "foo");
        assert_eq!(bundle.configs.len(), 3);
    }

    #[test]
    fn test_bundle_sources_empty_workspace() {
        let (_dir, ws) = workspace_with("servers: []\n");
        let inventory = load_inventory(ws.inventory_path()).unwrap();
        let sources = BundleSources::collect(&ws, &inventory).unwrap();
        assert!(sources.configs.is_empty());
        assert!(sources.templates.is_empty());
        assert!(sources.data.is_empty());
    }
}
