use crate::paths;
use anyhow::{Context, Result};
use std::process::{Command, Stdio};

/// Run a shell command and capture stdout.
///
/// In a dry run only commands marked `dry_run_safe` (read-only ones) are
/// executed; anything else is logged and returns an empty string.
pub fn run_command(cmd: &str, dry_run_safe: bool) -> Result<String> {
    run_command_with(cmd, dry_run_safe, paths::dry_run_enabled())
}

/// [`run_command`] with an explicit dry-run flag
pub fn run_command_with(cmd: &str, dry_run_safe: bool, dry_run: bool) -> Result<String> {
    if dry_run && !dry_run_safe {
        log::info!("Dry run: would run: {cmd}");
        return Ok(String::new());
    }

    log::debug!("Running: {cmd}");
    let output = Command::new("sh")
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to execute: {cmd}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if paths::dump_commands() {
        log::info!("{cmd}:\n{stdout}");
    }

    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "Command failed ({}): {cmd}\n{}{}",
            output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| format!("exit {c}")),
            stdout,
            stderr.trim()
        )
    }
}
