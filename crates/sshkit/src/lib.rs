//! # sshkit
//!
//! Run commands on remote hosts through the system `ssh` client.
//!
//! - Connection multiplexing through ControlMaster sockets
//! - Retry with exponential backoff for connections reset mid-negotiation
//! - Error categories derived from the client's stderr, with remediation
//!   commands for host key changes
//! - Optional `sudo -E` escalation for non-root logins

pub mod error;
pub mod retry;
pub mod session;
pub mod types;

pub use error::{Error, ErrorCategory, Result};
pub use retry::{LogCallback, NoCallback, RetryCallback, with_retry};
pub use session::{Session, manual_args, manual_command, remediation, shell_quote};
pub use types::{CommandOutput, RetryConfig, SessionOptions, SshTarget};
