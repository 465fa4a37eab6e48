//! `convoy login`: open a shell or run a command on servers by hand.

use crate::cli::LoginArgs;
use crate::config;
use crate::paths::{self, Workspace};
use crate::remote::target_for;
use crate::ui;
use anyhow::{Context, Result};
use declarative::{Inventory, ServerRecord};
use sshkit::{SshTarget, manual_args, manual_command};
use std::path::Path;
use std::process::Command;

pub fn run(inventory_path: &Path, args: &LoginArgs) -> Result<()> {
    let inventory = config::load_inventory(inventory_path)?;
    let workspace =
        Workspace::from_inventory(inventory_path)?.with_data_path(&inventory.data_path);
    let overlay = paths::overlay_enabled();

    for server in servers_for(&inventory, args.index)? {
        let target = target_for(server, &workspace, overlay);
        if !target.identity_file.is_file() {
            return Err(sshkit::Error::MissingKey(target.identity_file).into());
        }
        let remote = remote_command(&target, args.run.as_deref(), args.root);
        login(&target, remote.as_deref(), args.run.is_none())?;
    }
    Ok(())
}

/// The server at `index`, or every server in inventory order
pub fn servers_for(inventory: &Inventory, index: Option<usize>) -> Result<Vec<&ServerRecord>> {
    match index {
        Some(i) => {
            let server = inventory.servers.get(i).with_context(|| {
                format!(
                    "No server at index {i}; the inventory has {}",
                    inventory.servers.len()
                )
            })?;
            Ok(vec![server])
        }
        None => Ok(inventory.servers.iter().collect()),
    }
}

/// What to run on the far side; `None` opens a plain shell
pub fn remote_command(target: &SshTarget, run: Option<&str>, as_root: bool) -> Option<String> {
    let sudo = as_root && !target.is_privileged();
    match (run, sudo) {
        (Some(cmd), true) => Some(format!("sudo {cmd}")),
        (Some(cmd), false) => Some(cmd.to_string()),
        (None, true) => Some("sudo -i".to_string()),
        (None, false) => None,
    }
}

fn login(target: &SshTarget, remote: Option<&str>, interactive: bool) -> Result<()> {
    ui::dim(&manual_command(target, remote));
    let mut args = manual_args(target, remote);
    if interactive {
        args.insert(0, "-t".to_string());
    }
    let status = Command::new("ssh")
        .args(&args)
        .status()
        .context("Failed to start ssh")?;
    if !status.success() {
        log::warn!("ssh to {} exited with {status}", target.endpoint());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Inventory {
        Inventory {
            servers: vec![ServerRecord::named("foo"), ServerRecord::named("bar")],
            ..Inventory::default()
        }
    }

    #[test]
    fn test_servers_for_index() {
        let inv = inventory();
        let picked = servers_for(&inv, Some(1)).unwrap();
        assert_eq!(picked[0].name, "bar");

        let all: Vec<_> = servers_for(&inv, None)
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(all, vec!["foo", "bar"]);

        let err = servers_for(&inv, Some(2)).unwrap_err();
        assert_eq!(err.to_string(), "No server at index 2; the inventory has 2");
    }

    #[test]
    fn test_remote_command_sudo_only_for_other_users() {
        let admin = SshTarget::new("h", 22, "admin", "/k");
        let root = SshTarget::new("h", 22, "root", "/k");

        assert_eq!(
            remote_command(&admin, Some("uptime"), true).as_deref(),
            Some("sudo uptime")
        );
        assert_eq!(
            remote_command(&root, Some("uptime"), true).as_deref(),
            Some("uptime")
        );
        assert_eq!(remote_command(&admin, None, true).as_deref(), Some("sudo -i"));
        assert_eq!(remote_command(&admin, None, false), None);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(&path, "servers:\n  - name: foo\n    ssh_hostname: h\n    ssh_key: TBD\n")
            .unwrap();

        let err = run(&path, &LoginArgs::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Can't find ssh key {}", dir.path().join("configs/TBD").display())
        );
    }
}
