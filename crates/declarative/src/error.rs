//! Error types for module resolution and execution.
//!
//! Lifecycle functions return `anyhow::Result`; the engine wraps their
//! failures (and its own) in [`Error`] so callers can `downcast_ref` to
//! tell a dependency cycle from a remote failure.

use crate::types::{HostFailure, Phase};
use thiserror::Error;

/// Errors raised by the module engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph could not be ordered (cycle, or too deep to sort)
    #[error(
        "dependency cycle: could not order {} module(s) after {sweeps} sweep(s): {}",
        .unresolved.len(),
        .unresolved.join(", ")
    )]
    DependencyCycle {
        /// Number of sort sweeps performed before giving up
        sweeps: usize,
        /// Modules still waiting on their dependencies
        unresolved: Vec<String>,
    },

    /// A descriptor names a module that is not in the registry
    #[error("unknown module: {name}")]
    UnknownModule {
        /// Name that failed to resolve
        name: String,
    },

    /// The same module name was registered twice
    #[error("module already registered: {name}")]
    DuplicateModule {
        /// Name registered twice
        name: String,
    },

    /// A batch or selector refers to a server missing from the inventory
    #[error("unknown server: {name}")]
    UnknownServer {
        /// Server name
        name: String,
    },

    /// A role was resolved against an empty server list
    #[error("no servers to pick from for role {role}")]
    NoServers {
        /// Role being resolved
        role: String,
    },

    /// A selector decision could not be honoured
    #[error("selector {role}: {message}")]
    Selector {
        /// Role being resolved
        role: String,
        /// What went wrong
        message: String,
    },

    /// Options must be a JSON object
    #[error("module options must be an object, got: {found}")]
    InvalidOptions {
        /// The offending value
        found: String,
    },

    /// A lifecycle function failed on the control node
    #[error("error while running {phase} for {module}: {message}")]
    Lifecycle {
        /// Module descriptor (display form)
        module: String,
        /// Phase being run
        phase: Phase,
        /// Underlying error chain
        message: String,
    },

    /// One or more hosts failed during a remote phase
    #[error(
        "{phase} failed on {} host(s): {}",
        .failures.len(),
        join_failures(.failures)
    )]
    RemoteFailures {
        /// Phase that failed
        phase: Phase,
        /// Every host failure collected for the batch
        failures: Vec<HostFailure>,
    },

    /// A host asked for a config file the bundle doesn't carry
    #[error("Can't find {name}. We have: {}", .available.join(", "))]
    MissingConfig {
        /// Bundle key requested
        name: String,
        /// Bundle keys that do exist
        available: Vec<String>,
    },

    /// Malformed data between the control node and a host
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Wrap a lifecycle failure with the module and phase it came from.
    pub fn lifecycle(module: impl ToString, phase: Phase, err: &anyhow::Error) -> Self {
        Self::Lifecycle {
            module: module.to_string(),
            phase,
            message: format!("{err:#}"),
        }
    }
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
