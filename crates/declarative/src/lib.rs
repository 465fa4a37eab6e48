//! # Declarative
//!
//! The module engine behind `convoy`: resolve module dependencies, assign
//! modules to hosts, and drive the three-phase protocol.
//!
//! ## Core Concepts
//!
//! - **Module**: a named unit of desired state with optional lifecycle
//!   functions (`dependencies`, `local`, `run`, `parse_return`)
//! - **ModuleDescriptor**: a module name plus frozen options; the identity
//!   used for dependency resolution
//! - **RunPlan**: the resolved global order and the hosts of each module,
//!   cut into batches of modules sharing a host set
//! - **Dispatcher**: carries a batch to its hosts and brings back outputs
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Module, ModuleDescriptor, ModuleMap, ModuleRegistry, CORE_MODULE};
//!
//! let registry = ModuleRegistry::new()
//!     .with(Module::new(CORE_MODULE))?
//!     .with(Module::new("ntp").run(|ctx| {
//!         if ctx.use_this_host("time")? {
//!             // converge the time server
//!         }
//!         Ok(None)
//!     }))?;
//!
//! let map = ModuleMap::from(vec![ModuleDescriptor::new("ntp")]);
//! ```

pub mod context;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod module;
pub mod planner;
pub mod resolver;
pub mod selector;
pub mod types;

// Re-exports for convenience
pub use context::{
    DependencyContext, Dispatcher, LocalContext, NoProgress, ParseContext, ProgressCallback,
    RoleResolver, RunContext, SelectorSink, config_key, merge_json, network_config_name,
    other_config_name,
};
pub use descriptor::{ModuleDescriptor, OptionValue, Options};
pub use error::Error;
pub use executor::{PhaseEnv, execute, execute_batch, run_modules};
pub use module::{CORE_MODULE, Capabilities, Module, ModuleRegistry};
pub use planner::{Batch, HostFilter, HostGroup, ModuleMap, RunPlan};
pub use resolver::{MAX_SWEEPS, Resolver};
pub use selector::{Choice, SELECTOR_KEY, SELECTORS_CONFIG, Selections};
pub use types::{
    BatchSummary, DispatchResult, ExecuteSummary, HostBundle, HostFailure, HostReport, Inventory,
    Phase, ServerRecord,
};
