//! Run planning: host assignment and batching.
//!
//! Each host group resolves its own module list; the resulting closures
//! are assigned to the group's hosts, and the plan is cut into batches of
//! consecutive modules that target exactly the same hosts.

use crate::context::RoleResolver;
use crate::descriptor::ModuleDescriptor;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::types::{Inventory, ServerRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Which servers a host group applies to
#[derive(Clone)]
pub enum HostFilter {
    /// Every server in the inventory
    All,
    /// The server with this name
    Named(String),
    /// The server currently selected for a role
    Role(String),
    /// Any predicate over server records
    Custom(Arc<dyn Fn(&ServerRecord) -> bool + Send + Sync>),
}

impl HostFilter {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ServerRecord) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Servers matching this filter, in inventory order
    pub fn select<'i>(
        &self,
        inventory: &'i Inventory,
        roles: &mut dyn RoleResolver,
    ) -> anyhow::Result<Vec<&'i ServerRecord>> {
        let servers = &inventory.servers;
        let selected = match self {
            Self::All => servers.iter().collect(),
            Self::Named(name) => servers.iter().filter(|s| &s.name == name).collect(),
            Self::Role(role) => {
                if servers.is_empty() {
                    Vec::new()
                } else {
                    let chosen = roles.resolve_role(role, servers)?;
                    servers.iter().filter(|s| s.name == chosen.name).collect()
                }
            }
            Self::Custom(pred) => servers.iter().filter(|s| pred(s)).collect(),
        };
        Ok(selected)
    }
}

impl fmt::Debug for HostFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Role(role) => f.debug_tuple("Role").field(role).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Modules requested for the servers matching a filter
#[derive(Debug, Clone)]
pub struct HostGroup {
    pub filter: HostFilter,
    pub modules: Vec<ModuleDescriptor>,
}

/// What to run where: either one list for every server, or host groups
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    groups: Vec<HostGroup>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host group
    pub fn group(mut self, filter: HostFilter, modules: Vec<ModuleDescriptor>) -> Self {
        self.groups.push(HostGroup { filter, modules });
        self
    }

    pub fn groups(&self) -> &[HostGroup] {
        &self.groups
    }
}

impl From<Vec<ModuleDescriptor>> for ModuleMap {
    fn from(modules: Vec<ModuleDescriptor>) -> Self {
        Self::new().group(HostFilter::All, modules)
    }
}

impl From<Vec<HostGroup>> for ModuleMap {
    fn from(groups: Vec<HostGroup>) -> Self {
        Self { groups }
    }
}

/// Consecutive modules sharing one target host set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Server names, sorted
    pub servers: Vec<String>,
    pub modules: Vec<ModuleDescriptor>,
}

/// A resolved run: global module order plus the hosts each module targets
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    order: Vec<ModuleDescriptor>,
    targets: HashMap<ModuleDescriptor, BTreeSet<String>>,
}

impl RunPlan {
    /// Resolve every group and assign the closures to hosts.
    ///
    /// The global order concatenates the groups' orders, keeping each
    /// module's first occurrence.
    pub fn build(
        map: &ModuleMap,
        inventory: &Inventory,
        resolver: &mut Resolver<'_>,
        roles: &mut dyn RoleResolver,
    ) -> anyhow::Result<Self> {
        let mut order: Vec<ModuleDescriptor> = Vec::new();
        let mut per_server: BTreeMap<String, Vec<ModuleDescriptor>> = BTreeMap::new();

        for group in map.groups() {
            let resolved = resolver.resolve(&group.modules)?;
            for module in &resolved {
                if !order.contains(module) {
                    order.push(module.clone());
                }
            }

            for server in group.filter.select(inventory, roles)? {
                let assigned = per_server.entry(server.name.clone()).or_default();
                for module in &resolved {
                    if !assigned.contains(module) {
                        assigned.push(module.clone());
                    }
                }
            }
        }

        let mut targets: HashMap<ModuleDescriptor, BTreeSet<String>> = HashMap::new();
        for (server, modules) in per_server {
            for module in modules {
                targets.entry(module).or_default().insert(server.clone());
            }
        }

        Ok(Self { order, targets })
    }

    /// Every module in dependency order, including ones with no hosts
    pub fn order(&self) -> &[ModuleDescriptor] {
        &self.order
    }

    /// Servers `module` runs on
    pub fn targets(&self, module: &ModuleDescriptor) -> Option<&BTreeSet<String>> {
        self.targets.get(module)
    }

    /// Modules per server, in run order
    pub fn server_modules(&self) -> BTreeMap<&str, Vec<&ModuleDescriptor>> {
        let mut view: BTreeMap<&str, Vec<&ModuleDescriptor>> = BTreeMap::new();
        for module in &self.order {
            for server in self.targets.get(module).into_iter().flatten() {
                view.entry(server.as_str()).or_default().push(module);
            }
        }
        view
    }

    /// Cut the order into batches.
    ///
    /// Modules without hosts are skipped and do not split a batch.
    pub fn batches(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();
        let mut current: Option<Batch> = None;

        for module in &self.order {
            let servers: Vec<String> = match self.targets.get(module) {
                Some(set) if !set.is_empty() => set.iter().cloned().collect(),
                _ => {
                    log::debug!("Skipping {module}: no hosts");
                    continue;
                }
            };

            match current.as_mut() {
                Some(batch) if batch.servers == servers => batch.modules.push(module.clone()),
                _ => {
                    if let Some(done) = current.take() {
                        batches.push(done);
                    }
                    current = Some(Batch {
                        servers,
                        modules: vec![module.clone()],
                    });
                }
            }
        }
        batches.extend(current);
        batches
    }

    /// Check every targeted server exists in `inventory`
    pub fn validate(&self, inventory: &Inventory) -> Result<()> {
        for name in self.targets.values().flatten() {
            if inventory.server(name).is_none() {
                return Err(Error::UnknownServer { name: name.clone() });
            }
        }
        Ok(())
    }
}
