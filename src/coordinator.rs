//! The run coordinator: inventory in, converged hosts out.

use crate::config::{self, Settings};
use crate::paths::{self, Workspace};
use crate::progress::ConsoleProgress;
use crate::remote::{AgentBinary, ConnectionPool, RemoteExecutor, SshTransport, Transport};
use crate::selectors::SelectorStore;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use declarative::{
    ExecuteSummary, Inventory, ModuleMap, ModuleRegistry, PhaseEnv, Resolver, RunPlan, execute,
};
use std::path::Path;

/// Options for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Make changes; otherwise the run is dry
    pub apply: bool,
    /// Reach servers over their overlay address
    pub overlay: bool,
    /// Only print errors
    pub quiet: bool,
}

impl RunOptions {
    pub fn dry_run(&self) -> bool {
        !self.apply
    }
}

/// Drives a module map across the inventory
pub struct RunCoordinator<'r, T: Transport> {
    registry: &'r ModuleRegistry,
    workspace: Workspace,
    inventory: Inventory,
    settings: Settings,
    transport: T,
    options: RunOptions,
}

impl<'r> RunCoordinator<'r, SshTransport> {
    /// Load the inventory at `path` and reach hosts over ssh
    pub fn from_inventory(
        path: &Path,
        registry: &'r ModuleRegistry,
        options: RunOptions,
    ) -> Result<Self> {
        let inventory = config::load_inventory(path)?;
        let workspace = Workspace::from_inventory(path)?.with_data_path(&inventory.data_path);
        let settings = Settings::load(&workspace)?;
        let transport = SshTransport::new(
            settings.session_options(paths::control_dir()),
            AgentBinary::current()?,
            settings.ssh.agent_dir.clone(),
        )
        .with_dry_run(options.dry_run());
        Ok(Self::new(
            registry, workspace, inventory, settings, transport, options,
        ))
    }
}

impl<'r, T: Transport> RunCoordinator<'r, T> {
    pub fn new(
        registry: &'r ModuleRegistry,
        workspace: Workspace,
        inventory: Inventory,
        settings: Settings,
        transport: T,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            workspace,
            inventory,
            settings,
            transport,
            options,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Resolve `map`, then run every batch through the three phases.
    ///
    /// Connections live for the whole run and are closed on every exit path.
    pub fn run(&self, map: &ModuleMap) -> Result<ExecuteSummary> {
        let dry_run = self.options.dry_run();
        let mut selectors = SelectorStore::open(self.workspace.selectors_file(), dry_run)?;

        let mut resolver = Resolver::new(self.registry, &self.inventory);
        let plan = RunPlan::build(map, &self.inventory, &mut resolver, &mut selectors)?;
        plan.validate(&self.inventory)?;

        if !self.options.quiet {
            self.print_plan(&plan);
            if dry_run {
                ui::warn("Dry run: nothing will change. Pass --apply to make changes.");
            }
        }

        let pool = ConnectionPool::new(&self.transport, self.options.overlay);
        let mut executor = RemoteExecutor::new(
            pool,
            &self.workspace,
            &self.inventory,
            self.settings.ssh.jobs,
        );
        let config_dir = self.workspace.config_dir();
        let env = PhaseEnv {
            inventory: &self.inventory,
            config_dir: &config_dir,
            dry_run,
        };
        let mut progress = ConsoleProgress::new(self.options.quiet);

        let summary = execute(
            &plan,
            self.registry,
            &env,
            &mut executor,
            &mut selectors,
            &mut progress,
        )?;

        if !self.options.quiet {
            print_summary(&summary, dry_run);
        }
        Ok(summary)
    }

    fn print_plan(&self, plan: &RunPlan) {
        ui::header("Running:");
        for module in plan.order() {
            let hosts = plan
                .targets(module)
                .map(|set| set.iter().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            if hosts.is_empty() {
                ui::kv(&module.to_string(), &"(no hosts)".dimmed().to_string());
            } else {
                ui::kv(&module.to_string(), &hosts);
            }
        }
        println!();
    }
}

fn print_summary(summary: &ExecuteSummary, dry_run: bool) {
    println!();
    if summary.batches == 0 {
        ui::info("Nothing to run");
        return;
    }
    let verb = if dry_run { "Checked" } else { "Applied" };
    ui::success(&format!(
        "{verb} {} module(s) in {} batch(es), {} host call(s)",
        summary.modules, summary.batches, summary.host_calls
    ));
    if summary.selector_decisions > 0 {
        ui::kv(
            "Selector decisions",
            &summary.selector_decisions.to_string(),
        );
    }
}
