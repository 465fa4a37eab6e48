//! Dependency resolution: expand requested modules into their transitive
//! closure, then order it so every module follows its dependencies.

use crate::context::DependencyContext;
use crate::descriptor::ModuleDescriptor;
use crate::error::{Error, Result};
use crate::module::{CORE_MODULE, ModuleRegistry};
use crate::types::{Inventory, Phase};
use std::collections::HashMap;

/// Ordering gives up after this many sweeps over the unplaced modules
pub const MAX_SWEEPS: usize = 100;

/// Resolves module lists against a registry.
///
/// `dependencies` is called at most once per distinct descriptor for the
/// lifetime of the resolver; the edges are kept in a shared tree, so
/// resolving several host groups with one resolver costs one call per
/// module overall.
pub struct Resolver<'a> {
    registry: &'a ModuleRegistry,
    inventory: &'a Inventory,
    tree: HashMap<ModuleDescriptor, Vec<ModuleDescriptor>>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ModuleRegistry, inventory: &'a Inventory) -> Self {
        Self {
            registry,
            inventory,
            tree: HashMap::new(),
        }
    }

    /// Resolve `requested` (plus `core`) into a dependency-respecting order.
    ///
    /// Expansion runs from a LIFO worklist seeded with the requested modules
    /// followed by `core`. Ordering then sweeps the expansion order
    /// repeatedly, placing a module once all its dependencies are placed;
    /// `core` must be placed before anything else.
    pub fn resolve(&mut self, requested: &[ModuleDescriptor]) -> Result<Vec<ModuleDescriptor>> {
        let core = ModuleDescriptor::new(CORE_MODULE);
        let mut pending: Vec<ModuleDescriptor> = requested.to_vec();
        pending.push(core.clone());

        let mut checked: Vec<ModuleDescriptor> = Vec::new();
        while let Some(module) = pending.pop() {
            if checked.contains(&module) {
                continue;
            }
            let deps = self.dependencies_of(&module)?;
            checked.push(module);
            for dep in deps {
                if !checked.contains(&dep) && !pending.contains(&dep) {
                    pending.push(dep);
                }
            }
        }

        let order = self.order(&checked, &core)?;
        log::debug!(
            "Resolved {} module(s): {}",
            order.len(),
            order
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(order)
    }

    /// Direct dependencies of `module`, computed once and remembered
    pub fn dependencies_of(&mut self, module: &ModuleDescriptor) -> Result<Vec<ModuleDescriptor>> {
        if let Some(deps) = self.tree.get(module) {
            return Ok(deps.clone());
        }

        let definition = self.registry.get(&module.name)?;
        let ctx = DependencyContext {
            options: &module.options,
            inventory: self.inventory,
        };
        let deps = definition
            .call_dependencies(&ctx)
            .map_err(|e| Error::lifecycle(module, Phase::Dependencies, &e))?;
        for dep in &deps {
            // Fail early on typos rather than at run time
            self.registry.get(&dep.name)?;
        }

        self.tree.insert(module.clone(), deps.clone());
        Ok(deps)
    }

    /// Every edge discovered so far
    pub fn graph(&self) -> &HashMap<ModuleDescriptor, Vec<ModuleDescriptor>> {
        &self.tree
    }

    fn order(
        &self,
        checked: &[ModuleDescriptor],
        core: &ModuleDescriptor,
    ) -> Result<Vec<ModuleDescriptor>> {
        let mut remaining: Vec<&ModuleDescriptor> = checked.iter().collect();
        let mut ordered: Vec<ModuleDescriptor> = Vec::with_capacity(checked.len());
        let mut sweeps = 0;

        while !remaining.is_empty() {
            sweeps += 1;
            let placed_before = ordered.len();
            if sweeps <= MAX_SWEEPS {
                remaining.retain(|module| {
                    let core_placed = *module == core || ordered.contains(core);
                    let ready = core_placed
                        && self
                            .tree
                            .get(*module)
                            .is_none_or(|deps| deps.iter().all(|d| ordered.contains(d)));
                    if ready {
                        ordered.push((*module).clone());
                    }
                    !ready
                });
            }

            if ordered.len() == placed_before {
                return Err(Error::DependencyCycle {
                    sweeps,
                    unresolved: remaining.iter().map(ToString::to_string).collect(),
                });
            }
        }

        Ok(ordered)
    }
}
