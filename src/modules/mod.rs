//! Modules compiled into convoy.
//!
//! Hosts run the same binary as the control node, so this registry is how
//! a host finds the code for a module name it receives.

pub mod core;

use anyhow::Result;
use declarative::ModuleRegistry;

/// The registry of built-in modules
pub fn builtin() -> Result<ModuleRegistry> {
    Ok(ModuleRegistry::new().with(core::module())?)
}
