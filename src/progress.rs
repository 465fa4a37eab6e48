//! Progress display for runs.

use crate::ui;
use colored::Colorize;
use declarative::{Batch, BatchSummary, HostFailure, ModuleDescriptor, Phase, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner with a message, ticking in the background
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Prints batches as they run, with a spinner while hosts work
pub struct ConsoleProgress {
    quiet: bool,
    spinner: Option<ProgressBar>,
}

impl ConsoleProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            spinner: None,
        }
    }

    fn clear(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

impl ProgressCallback for ConsoleProgress {
    fn on_batch_start(&mut self, index: usize, total: usize, batch: &Batch) {
        if self.quiet {
            return;
        }
        ui::step(
            index + 1,
            total,
            &format!(
                "{} on {}",
                ui::module_list(&batch.modules).bold(),
                batch.servers.join(", ")
            ),
        );
    }

    fn on_phase(&mut self, phase: Phase, module: &ModuleDescriptor) {
        log::info!("{phase}: {module}");
        if self.quiet {
            return;
        }
        match phase {
            Phase::Run => {
                if self.spinner.is_none() {
                    self.spinner = Some(spinner("Running on hosts..."));
                }
            }
            Phase::ParseReturn => self.clear(),
            _ => {}
        }
    }

    fn on_failures(&mut self, failures: &[HostFailure]) {
        self.clear();
        for failure in failures {
            ui::error(&format!(
                "{} ({}): {}",
                failure.server, failure.endpoint, failure.message
            ));
        }
    }

    fn on_batch_complete(&mut self, _batch: &Batch, summary: &BatchSummary) {
        self.clear();
        if self.quiet {
            return;
        }
        ui::dim(&format!(
            "{} module(s) on {} host(s)",
            summary.modules, summary.hosts
        ));
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        self.clear();
    }
}
