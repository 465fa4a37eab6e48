//! Core types shared by the control node and the hosts

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_data_path() -> String {
    ".".to_string()
}

/// One target machine from the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique server name
    pub name: String,
    /// Hostname or address for SSH
    #[serde(default)]
    pub ssh_hostname: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Private key path, relative to the inventory's configs directory
    #[serde(default)]
    pub ssh_key: String,
    /// Address on the overlay network, used instead of `ssh_hostname` when
    /// the overlay is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard_ip: Option<String>,
    /// Anything else the inventory carries (roles, labels...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServerRecord {
    /// A record with defaults for everything but the name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssh_hostname: String::new(),
            ssh_port: default_ssh_port(),
            ssh_user: default_ssh_user(),
            ssh_key: String::new(),
            wireguard_ip: None,
            extra: BTreeMap::new(),
        }
    }

    /// Look up an inventory attribute that isn't one of the SSH fields
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// The parsed inventory document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub environment: String,
    /// Data directory, relative to the inventory file
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    /// Free-form top-level keys, available to modules
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            environment: String::new(),
            data_path: default_data_path(),
            servers: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Inventory {
    /// Find a server by name
    pub fn server(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Server names in inventory order
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Everything a host needs to run its modules, built fresh per call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostBundle {
    /// The server this bundle was built for
    pub host: Option<ServerRecord>,
    pub inventory: Inventory,
    pub environment: String,
    /// Config files keyed by `configs/<relative path>`, plus the inventory
    /// document under its own name
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
    /// Template files keyed by relative path
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Raw data files keyed by relative path
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Lifecycle phases, in the order they run for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Dependencies,
    Local,
    Run,
    ParseReturn,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dependencies => "dependencies",
            Self::Local => "local",
            Self::Run => "run",
            Self::ParseReturn => "parse_return",
        };
        f.write_str(name)
    }
}

/// One host's outputs for a batch: one entry per module, in batch order.
///
/// `Value::Null` marks a module without a run phase.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReport {
    pub server: String,
    pub outputs: Vec<Value>,
}

/// A host that failed during a remote phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub server: String,
    /// `user@host:port` the call went to
    pub endpoint: String,
    pub message: String,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.server, self.endpoint, self.message)
    }
}

/// Results of dispatching a batch to its hosts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchResult {
    pub reports: Vec<HostReport>,
    pub failures: Vec<HostFailure>,
}

/// Summary of a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub modules: usize,
    pub hosts: usize,
    pub selector_decisions: usize,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteSummary {
    pub batches: usize,
    /// Module executions summed over batches
    pub modules: usize,
    /// Host calls summed over batches
    pub host_calls: usize,
    pub selector_decisions: usize,
}

impl ExecuteSummary {
    /// Fold a batch into the run total
    pub fn add(&mut self, batch: &BatchSummary) {
        self.batches += 1;
        self.modules += batch.modules;
        self.host_calls += batch.hosts;
        self.selector_decisions += batch.selector_decisions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let server: ServerRecord = serde_json::from_value(serde_json::json!({
            "name": "foo",
            "ssh_hostname": "10.0.0.1",
            "roles": ["db"],
        }))
        .unwrap();
        assert_eq!(server.ssh_port, 22);
        assert_eq!(server.ssh_user, "root");
        assert!(server.wireguard_ip.is_none());
        assert_eq!(server.attribute("roles"), Some(&serde_json::json!(["db"])));
    }

    #[test]
    fn test_inventory_lookup() {
        let inventory = Inventory {
            servers: vec![ServerRecord::named("foo"), ServerRecord::named("bar")],
            ..Inventory::default()
        };
        assert_eq!(inventory.server_names(), vec!["foo", "bar"]);
        assert!(inventory.server("bar").is_some());
        assert!(inventory.server("baz").is_none());
        assert_eq!(inventory.data_path, ".");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::ParseReturn.to_string(), "parse_return");
        assert_eq!(Phase::Run.to_string(), "run");
    }

    #[test]
    fn test_summary_add() {
        let mut summary = ExecuteSummary::default();
        summary.add(&BatchSummary {
            modules: 2,
            hosts: 3,
            selector_decisions: 1,
        });
        summary.add(&BatchSummary {
            modules: 1,
            hosts: 1,
            selector_decisions: 0,
        });
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.modules, 3);
        assert_eq!(summary.host_calls, 4);
        assert_eq!(summary.selector_decisions, 1);
    }
}
