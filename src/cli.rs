use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Declarative host configuration over SSH", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Inventory file describing the servers
    #[arg(short, long, global = true, env = "CONVOY_INVENTORY")]
    pub inventory_path: Option<PathBuf>,

    /// Make changes (without this the run is dry)
    #[arg(short, long)]
    pub apply: bool,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a shell (or run a command) on servers
    Login(LoginArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Serve one run request on stdin (used on hosts)
    #[command(hide = true)]
    Agent,
}

#[derive(Args, Debug, Default)]
pub struct LoginArgs {
    /// Server position in the inventory; every server when omitted
    pub index: Option<usize>,

    /// Command to run instead of an interactive shell
    #[arg(short, long)]
    pub run: Option<String>,

    /// Run as root (through sudo for other users)
    #[arg(long)]
    pub root: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_run_is_dry() {
        let cli = Cli::try_parse_from(["convoy", "-i", "inventory.yaml"]).unwrap();
        assert_eq!(cli.inventory_path, Some(PathBuf::from("inventory.yaml")));
        assert!(!cli.apply);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["convoy", "-i", "inventory.yaml", "--apply"]).unwrap();
        assert!(cli.apply);
    }

    #[test]
    fn test_login_args() {
        let cli = Cli::try_parse_from([
            "convoy", "login", "1", "--run", "uptime", "--root", "-i", "inv.yaml",
        ])
        .unwrap();
        let Some(Command::Login(args)) = cli.command else {
            panic!("expected login");
        };
        assert_eq!(args.index, Some(1));
        assert_eq!(args.run.as_deref(), Some("uptime"));
        assert!(args.root);
        assert_eq!(cli.inventory_path, Some(PathBuf::from("inv.yaml")));
    }
}
