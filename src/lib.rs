//! # convoy
//!
//! Declarative host configuration over SSH. A program built on convoy
//! registers its modules, says which hosts get which modules, and hands
//! control to [`run`]:
//!
//! ```ignore
//! use declarative::{HostFilter, ModuleDescriptor, ModuleMap};
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = convoy::modules::builtin()?.with(ntp::module())?;
//!     let map = ModuleMap::new()
//!         .group(HostFilter::All, vec![ModuleDescriptor::new("ntp")])
//!         .group(HostFilter::Role("db".into()), vec![ModuleDescriptor::new("postgresql")]);
//!     convoy::run(std::env::args_os(), &registry, map)
//! }
//! ```
//!
//! The same binary serves as the agent on every host, so hosts always run
//! exactly the module code the control node was built with.

pub mod agent;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod exec;
pub mod fsutil;
pub mod login;
pub mod modules;
pub mod paths;
pub mod progress;
pub mod remote;
pub mod selectors;
pub mod ui;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use coordinator::{RunCoordinator, RunOptions};
use declarative::{ModuleMap, ModuleRegistry};
use std::ffi::OsString;
use std::io;
use std::path::Path;

/// Parse `args` and do what they ask
pub fn run<I, T>(args: I, registry: &ModuleRegistry, map: impl Into<ModuleMap>) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(&cli);

    match cli.command {
        Some(Command::Agent) => agent::serve(registry),
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "convoy", &mut io::stdout());
            Ok(())
        }
        Some(Command::Login(args)) => login::run(inventory_path(cli.inventory_path.as_deref())?, &args),
        None => {
            paths::export_dry_run(!cli.apply);
            let options = RunOptions {
                apply: cli.apply,
                overlay: paths::overlay_enabled(),
                quiet: cli.quiet,
            };
            let path = inventory_path(cli.inventory_path.as_deref())?;
            let coordinator = RunCoordinator::from_inventory(path, registry, options)?;
            coordinator.run(&map.into())?;
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli) {
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();
}

fn inventory_path(path: Option<&Path>) -> Result<&Path> {
    path.context("No inventory given; pass -i/--inventory-path")
}
