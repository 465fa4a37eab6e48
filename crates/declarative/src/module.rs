//! Module definitions and the registry.
//!
//! A module is a name plus up to four optional lifecycle functions. Which
//! ones a module provides is fixed when it is built, so the engine asks
//! [`Module::capabilities`] instead of probing at run time.

use crate::context::{DependencyContext, LocalContext, ParseContext, RunContext};
use crate::descriptor::ModuleDescriptor;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the module every run includes and every other module follows
pub const CORE_MODULE: &str = "core";

pub type DependenciesFn =
    Arc<dyn Fn(&DependencyContext<'_>) -> anyhow::Result<Vec<ModuleDescriptor>> + Send + Sync>;
pub type LocalFn = Arc<dyn Fn(&mut LocalContext<'_>) -> anyhow::Result<()> + Send + Sync>;
pub type RunFn = Arc<dyn Fn(&mut RunContext<'_>) -> anyhow::Result<Option<Value>> + Send + Sync>;
pub type ParseReturnFn =
    Arc<dyn Fn(&mut ParseContext<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Which lifecycle functions a module provides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub dependencies: bool,
    pub local: bool,
    pub run: bool,
    pub parse_return: bool,
}

impl Capabilities {
    pub fn is_empty(&self) -> bool {
        !(self.dependencies || self.local || self.run || self.parse_return)
    }
}

/// A module: a unit of desired state with optional lifecycle functions
#[derive(Clone)]
pub struct Module {
    name: String,
    dependencies: Option<DependenciesFn>,
    local: Option<LocalFn>,
    run: Option<RunFn>,
    parse_return: Option<ParseReturnFn>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: None,
            local: None,
            run: None,
            parse_return: None,
        }
    }

    /// Modules this one needs first, given its options
    pub fn dependencies<F>(mut self, f: F) -> Self
    where
        F: Fn(&DependencyContext<'_>) -> anyhow::Result<Vec<ModuleDescriptor>>
            + Send
            + Sync
            + 'static,
    {
        self.dependencies = Some(Arc::new(f));
        self
    }

    /// Control-node preparation, once per batch before hosts are contacted
    pub fn local<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut LocalContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.local = Some(Arc::new(f));
        self
    }

    /// Convergence on the host; returns data for `parse_return`
    pub fn run<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut RunContext<'_>) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(f));
        self
    }

    /// Control-node reconciliation of one host's results
    pub fn parse_return<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParseContext<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.parse_return = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            dependencies: self.dependencies.is_some(),
            local: self.local.is_some(),
            run: self.run.is_some(),
            parse_return: self.parse_return.is_some(),
        }
    }

    /// Descriptor for this module with no options
    pub fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(&self.name)
    }

    pub fn call_dependencies(
        &self,
        ctx: &DependencyContext<'_>,
    ) -> anyhow::Result<Vec<ModuleDescriptor>> {
        match &self.dependencies {
            Some(f) => f(ctx),
            None => Ok(Vec::new()),
        }
    }

    pub fn call_local(&self, ctx: &mut LocalContext<'_>) -> anyhow::Result<()> {
        match &self.local {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    /// `None` when the module has no run phase
    pub fn call_run(&self, ctx: &mut RunContext<'_>) -> Option<anyhow::Result<Option<Value>>> {
        self.run.as_ref().map(|f| f(ctx))
    }

    pub fn call_parse_return(
        &self,
        ctx: &mut ParseContext<'_>,
        results: &[Value],
    ) -> anyhow::Result<()> {
        match &self.parse_return {
            Some(f) => f(ctx, results),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// All modules known to a run, by name
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module; names must be unique
    pub fn register(&mut self, module: Module) -> Result<()> {
        if self.modules.contains_key(module.name()) {
            return Err(Error::DuplicateModule {
                name: module.name().to_string(),
            });
        }
        if module.capabilities().is_empty() {
            log::warn!(
                "Module {} has no lifecycle functions and will do nothing",
                module.name()
            );
        }
        log::debug!("Registered module {} {:?}", module.name(), module.capabilities());
        self.modules.insert(module.name().to_string(), module);
        Ok(())
    }

    /// Builder-style register
    pub fn with(mut self, module: Module) -> Result<Self> {
        self.register(module)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Module> {
        self.modules.get(name).ok_or_else(|| Error::UnknownModule {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let module = Module::new("ntp")
            .run(|_| Ok(None))
            .parse_return(|_, _| Ok(()));
        let caps = module.capabilities();
        assert!(caps.run && caps.parse_return);
        assert!(!caps.dependencies && !caps.local);
        assert!(Module::new("empty").capabilities().is_empty());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ModuleRegistry::new();
        registry.register(Module::new("ntp")).unwrap();
        let err = registry.register(Module::new("ntp")).unwrap_err();
        assert!(matches!(err, Error::DuplicateModule { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ModuleRegistry::new()
            .with(Module::new(CORE_MODULE))
            .unwrap()
            .with(Module::new("ntp"))
            .unwrap();
        assert!(registry.get("ntp").is_ok());
        assert!(matches!(
            registry.get("postgresql"),
            Err(Error::UnknownModule { .. })
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["core", "ntp"]);
    }

    #[test]
    fn test_missing_functions_are_noops() {
        let module = Module::new("bare");
        let inventory = crate::types::Inventory::default();
        let options = crate::descriptor::Options::new();
        let deps = module
            .call_dependencies(&DependencyContext {
                options: &options,
                inventory: &inventory,
            })
            .unwrap();
        assert!(deps.is_empty());

        let bundle = crate::types::HostBundle::default();
        let mut ctx = RunContext::new(&options, &bundle, false);
        assert!(module.call_run(&mut ctx).is_none());
    }
}
