//! Type definitions for SSH targets and session settings.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    /// Absolute path of the private key
    pub identity_file: PathBuf,
}

impl SshTarget {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        identity_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            user: user.into(),
            identity_file: identity_file.into(),
        }
    }

    /// Connection cache key: `host-port`
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.hostname, self.port)
    }

    /// `user@host:port`, for messages
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.hostname, self.port)
    }

    /// Whether commands already run as root
    pub fn is_privileged(&self) -> bool {
        self.user == "root"
    }

    /// Host argument for `ssh-keygen -R`
    pub fn known_hosts_name(&self) -> String {
        if self.port == 22 {
            self.hostname.clone()
        } else {
            format!("[{}]:{}", self.hostname, self.port)
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Directory for ControlMaster sockets; `None` disables multiplexing
    pub control_dir: Option<PathBuf>,
    /// How long an idle master connection stays up
    pub control_persist: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
    /// Path to the ssh client
    pub ssh_program: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            control_dir: None,
            control_persist: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            ssh_program: "ssh".to_string(),
        }
    }
}

/// Output from a remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Get stdout as a string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Exit status 255 is the ssh client's own failure, not the command's
    pub fn is_transport_failure(&self) -> bool {
        self.code == Some(255)
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}
