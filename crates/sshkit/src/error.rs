//! Error types for SSH operations.
//!
//! Errors are categorized from the ssh client's stderr so that transient
//! negotiation failures are retried, while identity and authentication
//! problems fail fast with something the operator can act on.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of SSH errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection dropped during negotiation (transient, retryable)
    Transient,
    /// Host key mismatch
    HostIdentity,
    /// Key rejected by the server
    Authentication,
    /// Host could not be reached at all
    Unreachable,
    /// Private key missing on the control node
    MissingKey,
    /// The remote command itself failed
    Command,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Connection reset during negotiation",
            Self::HostIdentity => "Host identity changed",
            Self::Authentication => "Authentication failed",
            Self::Unreachable => "Host unreachable",
            Self::MissingKey => "SSH key not found",
            Self::Command => "Remote command failed",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Transient => "Try again; the host may still be booting",
            Self::HostIdentity => {
                "Check the host was rebuilt on purpose, then remove the old known_hosts entry"
            }
            Self::Authentication => "Check ssh_user and ssh_key in the inventory",
            Self::Unreachable => "Check the address, port and that sshd is running",
            Self::MissingKey => "Put the key in the configs directory next to the inventory",
            Self::Command => "Check the remote output above",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur talking to a host.
#[derive(Debug, Error)]
pub enum Error {
    /// The private key file does not exist
    #[error("Can't find ssh key {}", .0.display())]
    MissingKey(PathBuf),

    /// Connection reset or closed while negotiating
    #[error("connection to {endpoint} dropped during negotiation: {message}")]
    Transient {
        /// `user@host:port`
        endpoint: String,
        /// ssh client output
        message: String,
    },

    /// Host key doesn't match the known one
    #[error(
        "host identity check failed for {endpoint}: {message}\nTo inspect the new key and accept it, run:\n    {remediation}"
    )]
    HostIdentity {
        /// `user@host:port`
        endpoint: String,
        /// ssh client output
        message: String,
        /// Literal command to run by hand
        remediation: String,
    },

    /// Key rejected
    #[error("authentication failed for {endpoint}: {message}")]
    Authentication {
        /// `user@host:port`
        endpoint: String,
        /// ssh client output
        message: String,
    },

    /// DNS failure, refused or timed out
    #[error("cannot reach {endpoint}: {message}")]
    Unreachable {
        /// `user@host:port`
        endpoint: String,
        /// ssh client output
        message: String,
    },

    /// Remote command exited non-zero
    #[error("command failed on {endpoint} (exit {}): {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()), .stderr.trim())]
    CommandFailed {
        /// `user@host:port`
        endpoint: String,
        /// Exit code, if the command wasn't killed
        code: Option<i32>,
        /// Standard error output from the failed command
        stderr: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for SSH operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingKey(_) => ErrorCategory::MissingKey,
            Error::Transient { .. } => ErrorCategory::Transient,
            Error::HostIdentity { .. } => ErrorCategory::HostIdentity,
            Error::Authentication { .. } => ErrorCategory::Authentication,
            Error::Unreachable { .. } => ErrorCategory::Unreachable,
            Error::CommandFailed { .. } => ErrorCategory::Command,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Create an error from ssh client output.
    ///
    /// `remediation` is the command suggested when the host key changed.
    pub fn from_ssh_output(stderr: &str, endpoint: &str, remediation: &str) -> Self {
        let stderr_lower = stderr.to_lowercase();
        let message = stderr.trim().to_string();
        let endpoint = endpoint.to_string();

        if stderr_lower.contains("remote host identification has changed")
            || stderr_lower.contains("host key verification failed")
            || stderr_lower.contains("host key for")
        {
            return Error::HostIdentity {
                endpoint,
                message,
                remediation: remediation.to_string(),
            };
        }

        if stderr_lower.contains("connection reset")
            || stderr_lower.contains("kex_exchange_identification")
            || stderr_lower.contains("ssh_exchange_identification")
            || stderr_lower.contains("connection closed by")
        {
            return Error::Transient { endpoint, message };
        }

        if stderr_lower.contains("permission denied")
            || stderr_lower.contains("too many authentication failures")
        {
            return Error::Authentication { endpoint, message };
        }

        if stderr_lower.contains("could not resolve hostname")
            || stderr_lower.contains("connection refused")
            || stderr_lower.contains("no route to host")
            || stderr_lower.contains("timed out")
            || stderr_lower.contains("network is unreachable")
        {
            return Error::Unreachable { endpoint, message };
        }

        Error::Other(format!("ssh to {endpoint} failed: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EP: &str = "root@10.0.0.1:22";

    #[test]
    fn test_classify_transient() {
        let err = Error::from_ssh_output(
            "kex_exchange_identification: read: Connection reset by peer\n",
            EP,
            "",
        );
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_host_identity_carries_command() {
        let stderr = "@@@@@@@@\n@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n";
        let err = Error::from_ssh_output(stderr, EP, "ssh-keygen -R 10.0.0.1");
        assert_eq!(err.category(), ErrorCategory::HostIdentity);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("    ssh-keygen -R 10.0.0.1"));
    }

    #[test]
    fn test_classify_other_categories() {
        let auth = Error::from_ssh_output("root@10.0.0.1: Permission denied (publickey).", EP, "");
        assert_eq!(auth.category(), ErrorCategory::Authentication);

        let down = Error::from_ssh_output(
            "ssh: connect to host 10.0.0.1 port 22: Connection refused",
            EP,
            "",
        );
        assert_eq!(down.category(), ErrorCategory::Unreachable);

        let weird = Error::from_ssh_output("something odd", EP, "");
        assert_eq!(weird.category(), ErrorCategory::Other);
        assert!(weird.to_string().contains(EP));
    }

    #[test]
    fn test_missing_key_message() {
        let err = Error::MissingKey(PathBuf::from("/tmp/configs/TBD"));
        assert_eq!(err.to_string(), "Can't find ssh key /tmp/configs/TBD");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_command_failed_message() {
        let err = Error::CommandFailed {
            endpoint: EP.into(),
            code: Some(3),
            stderr: "nope\n".into(),
        };
        assert_eq!(err.to_string(), "command failed on root@10.0.0.1:22 (exit 3): nope");
    }
}
