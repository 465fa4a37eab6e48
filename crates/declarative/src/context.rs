//! Lifecycle contexts and provider traits
//!
//! Each lifecycle function receives a context for its phase. The traits
//! at the bottom let the engine run without knowing how hosts are reached,
//! where selector decisions are stored, or how progress is shown.

use crate::descriptor::{ModuleDescriptor, Options};
use crate::error::{Error, Result};
use crate::planner::Batch;
use crate::selector::{self, Choice, SELECTORS_CONFIG, Selections};
use crate::types::{BatchSummary, DispatchResult, HostBundle, HostFailure, Inventory, Phase, ServerRecord};
use serde_json::{Map, Value};
use std::path::Path;

/// File name (inside the configs directory) of an `other-*` document
pub fn other_config_name(name: &str) -> String {
    format!("other-{name}")
}

/// File name (inside the configs directory) of a `networks-*` document
pub fn network_config_name(name: &str) -> String {
    format!("networks-{name}")
}

/// Bundle key for a file in the configs directory
pub fn config_key(file_name: &str) -> String {
    format!("configs/{file_name}")
}

/// Context for `dependencies`
#[derive(Debug, Clone, Copy)]
pub struct DependencyContext<'a> {
    pub options: &'a Options,
    pub inventory: &'a Inventory,
}

/// Context for `local`, run once per batch on the control node
pub struct LocalContext<'a> {
    pub options: &'a Options,
    pub inventory: &'a Inventory,
    pub config_dir: &'a Path,
    pub dry_run: bool,
    /// Role decisions; fresh ones are recorded immediately
    pub roles: &'a mut dyn RoleResolver,
}

impl LocalContext<'_> {
    /// The server that fills `role`
    pub fn selector(&mut self, role: &str) -> anyhow::Result<ServerRecord> {
        self.roles.resolve_role(role, &self.inventory.servers)
    }
}

/// Context for `parse_return`, run once per host result on the control node
pub struct ParseContext<'a> {
    pub options: &'a Options,
    pub inventory: &'a Inventory,
    pub config_dir: &'a Path,
    /// Host whose results are being reconciled
    pub server: &'a ServerRecord,
    pub dry_run: bool,
    /// Role decisions; fresh ones are recorded immediately
    pub roles: &'a mut dyn RoleResolver,
}

impl ParseContext<'_> {
    /// The server that fills `role`
    pub fn selector(&mut self, role: &str) -> anyhow::Result<ServerRecord> {
        self.roles.resolve_role(role, &self.inventory.servers)
    }

    /// Whether the host being reconciled fills `role`
    pub fn is_selected(&mut self, role: &str) -> anyhow::Result<bool> {
        Ok(self.selector(role)?.name == self.server.name)
    }
}

/// Context for `run`, executed on the host.
///
/// Carries the host bundle and accumulates return data, which is merged
/// into the module's output after `run` finishes.
#[derive(Debug)]
pub struct RunContext<'a> {
    pub options: &'a Options,
    pub bundle: &'a HostBundle,
    pub dry_run: bool,
    return_data: Map<String, Value>,
}

impl<'a> RunContext<'a> {
    pub fn new(options: &'a Options, bundle: &'a HostBundle, dry_run: bool) -> Self {
        Self {
            options,
            bundle,
            dry_run,
            return_data: Map::new(),
        }
    }

    /// The server this run is for
    pub fn server(&self) -> Result<&'a ServerRecord> {
        self.bundle
            .host
            .as_ref()
            .ok_or_else(|| Error::Protocol("host bundle has no server record".into()))
    }

    pub fn inventory(&self) -> &'a Inventory {
        &self.bundle.inventory
    }

    /// Contents of a file from the configs directory
    pub fn config_file(&self, file_name: &str) -> Result<&'a str> {
        let key = config_key(file_name);
        self.bundle
            .configs
            .get(&key)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingConfig {
                name: key,
                available: self.bundle.configs.keys().cloned().collect(),
            })
    }

    /// Parsed `other-<name>` document
    pub fn other_config(&self, name: &str) -> anyhow::Result<Value> {
        let raw = self.config_file(&other_config_name(name))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Parsed `networks-<name>` document.
    ///
    /// A dry run may target hosts that were never reconciled, so a missing
    /// document reads as `{}` there.
    pub fn network_config(&self, name: &str) -> anyhow::Result<Value> {
        match self.config_file(&network_config_name(name)) {
            Ok(raw) => Ok(serde_json::from_str(raw)?),
            Err(Error::MissingConfig { .. }) if self.dry_run => Ok(Value::Object(Map::new())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn template(&self, name: &str) -> Option<&'a str> {
        self.bundle.templates.get(name).map(String::as_str)
    }

    pub fn data_file(&self, name: &str) -> Option<&'a [u8]> {
        self.bundle.data.get(name).map(Vec::as_slice)
    }

    /// Queue data to send back with this module's output.
    ///
    /// Objects are deep-merged into what is already queued; anything
    /// else is ignored.
    pub fn add_return_data(&mut self, data: Value) {
        match data {
            Value::Object(map) => merge_json(&mut self.return_data, map),
            other => log::warn!("Ignoring non-object return data: {other}"),
        }
    }

    pub fn return_data(&self) -> &Map<String, Value> {
        &self.return_data
    }

    pub fn take_return_data(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.return_data)
    }

    /// The server that fills `role`.
    ///
    /// Uses the persisted decision when there is one. Otherwise the role is
    /// hashed onto the inventory and the pick is sent back as return data
    /// so the control node can persist it.
    pub fn selector(&mut self, role: &str) -> Result<&'a ServerRecord> {
        let mut known = self.persisted_selections()?;
        known.extend(selector::decisions_in(&Value::Object(self.return_data.clone())));

        let servers: &'a [ServerRecord] = &self.bundle.inventory.servers;
        match selector::choose(role, servers, &known)? {
            Choice::Persisted(server) => Ok(server),
            Choice::Fresh(server) => {
                self.add_return_data(selector::decision_data(role, &server.name));
                Ok(server)
            }
        }
    }

    /// Whether this host is the one selected for `role`
    pub fn use_this_host(&mut self, role: &str) -> Result<bool> {
        let chosen = self.selector(role)?;
        Ok(chosen.name == self.server()?.name)
    }

    fn persisted_selections(&self) -> Result<Selections> {
        let key = config_key(&other_config_name(SELECTORS_CONFIG));
        match self.bundle.configs.get(&key) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| Error::Protocol(format!("invalid {key}: {e}"))),
            None => Ok(Selections::new()),
        }
    }
}

/// Deep-merge `source` into `target`: nested objects merge, everything else
/// is replaced.
pub fn merge_json(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Carries a batch's modules to its hosts and brings back their outputs.
///
/// Implementations must contact every server before reporting, and report
/// per-host failures in the result rather than stopping at the first one.
pub trait Dispatcher {
    fn dispatch(
        &mut self,
        servers: &[ServerRecord],
        modules: &[ModuleDescriptor],
        dry_run: bool,
    ) -> anyhow::Result<DispatchResult>;
}

/// Receives selector decisions found in host outputs
pub trait SelectorSink {
    fn record(&mut self, decisions: &Selections) -> anyhow::Result<()>;
}

/// Picks the server for a role on the control node.
///
/// Implementations persist fresh decisions as they are made.
pub trait RoleResolver {
    fn resolve_role(&mut self, role: &str, servers: &[ServerRecord]) -> anyhow::Result<ServerRecord>;
}

/// Progress callback for batch execution
pub trait ProgressCallback {
    /// Called before a batch's local phase
    fn on_batch_start(&mut self, index: usize, total: usize, batch: &Batch);

    /// Called as a phase starts for a module
    fn on_phase(&mut self, phase: Phase, module: &ModuleDescriptor);

    /// Called with every host failure of a batch, before the run aborts
    fn on_failures(&mut self, _failures: &[HostFailure]) {}

    /// Called when a batch completes
    fn on_batch_complete(&mut self, batch: &Batch, summary: &BatchSummary);
}

/// Progress callback that does nothing
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _index: usize, _total: usize, _batch: &Batch) {}
    fn on_phase(&mut self, _phase: Phase, _module: &ModuleDescriptor) {}
    fn on_batch_complete(&mut self, _batch: &Batch, _summary: &BatchSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SELECTOR_KEY;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn bundle_for(host: &str, names: &[&str]) -> HostBundle {
        let servers: Vec<ServerRecord> = names.iter().map(|n| ServerRecord::named(*n)).collect();
        HostBundle {
            host: servers.iter().find(|s| s.name == host).cloned(),
            inventory: Inventory {
                servers,
                ..Inventory::default()
            },
            ..HostBundle::default()
        }
    }

    #[test]
    fn test_merge_json_is_deep() {
        let mut target = json!({"selector": {"db": "foo"}, "keep": 1})
            .as_object()
            .cloned()
            .unwrap();
        let source = json!({"selector": {"cache": "bar"}, "keep": 2})
            .as_object()
            .cloned()
            .unwrap();
        merge_json(&mut target, source);
        assert_eq!(
            Value::Object(target),
            json!({"selector": {"db": "foo", "cache": "bar"}, "keep": 2})
        );
    }

    #[test]
    fn test_missing_config_lists_available() {
        let mut bundle = bundle_for("foo", &["foo"]);
        bundle
            .configs
            .insert("configs/other-foo".into(), "{}".into());
        let options = Options::new();
        let ctx = RunContext::new(&options, &bundle, false);

        let err = ctx.config_file("nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Can't find configs/nope. We have: configs/other-foo"
        );
        assert_eq!(ctx.other_config("foo").unwrap(), json!({}));
        assert!(ctx.network_config("foo").is_err());

        let dry = RunContext::new(&options, &bundle, true);
        assert_eq!(dry.network_config("foo").unwrap(), json!({}));
    }

    #[test]
    fn test_fresh_selection_becomes_return_data() {
        let bundle = bundle_for("foo", &["foo", "bar"]);
        let options = Options::new();
        let mut ctx = RunContext::new(&options, &bundle, false);

        let expected = ["foo", "bar"][selector::hash_index("db", 2)];
        let chosen = ctx.selector("db").unwrap().name.clone();
        assert_eq!(chosen, expected);
        assert_eq!(
            ctx.return_data()[SELECTOR_KEY],
            json!({"db": expected})
        );
        assert_eq!(ctx.use_this_host("db").unwrap(), expected == "foo");
    }

    #[test]
    fn test_persisted_selection_wins() {
        let mut bundle = bundle_for("bar", &["foo", "bar"]);
        let persisted: BTreeMap<&str, &str> = [("db", "bar")].into_iter().collect();
        bundle.configs.insert(
            "configs/other-selectors.json".into(),
            serde_json::to_string(&persisted).unwrap(),
        );
        let options = Options::new();
        let mut ctx = RunContext::new(&options, &bundle, false);

        assert!(ctx.use_this_host("db").unwrap());
        assert!(ctx.return_data().is_empty());
    }
}
