//! Reaching hosts.
//!
//! The control node ships a copy of its own executable to each host (keyed
//! by content hash, so it is uploaded once per build) and runs it as
//! `<binary> agent`. A call writes an [`AgentRequest`] to the agent's stdin
//! and reads an [`AgentResponse`] from its stdout.

use crate::config::BundleSources;
use crate::paths::{ENV_DRY_RUN, Workspace};
use anyhow::{Context, Result};
use declarative::{
    DispatchResult, Dispatcher, HostBundle, HostFailure, HostReport, Inventory, ModuleDescriptor,
    ServerRecord,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sshkit::{Session, SessionOptions, SshTarget, shell_quote};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Hidden subcommand the agent runs under
pub const AGENT_SUBCOMMAND: &str = "agent";

/// One run phase for one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub bundle: HostBundle,
    pub modules: Vec<ModuleDescriptor>,
    pub dry_run: bool,
}

/// What the agent sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    /// One output per requested module
    Completed { outputs: Vec<Value> },
    /// A module failed; the error chain as text
    Failed { error: String },
}

/// An open line to one host's agent
pub trait AgentChannel: Send + Sync {
    fn call(&self, request: &AgentRequest) -> Result<AgentResponse>;

    /// Release the underlying connection
    fn close(&self) {}
}

/// Opens agent channels
pub trait Transport {
    fn open(&self, target: &SshTarget) -> Result<Arc<dyn AgentChannel>>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn open(&self, target: &SshTarget) -> Result<Arc<dyn AgentChannel>> {
        (**self).open(target)
    }
}

/// Where to reach `server`.
///
/// With the overlay active, servers that have an overlay address are
/// reached there on port 22.
pub fn target_for(server: &ServerRecord, workspace: &Workspace, overlay: bool) -> SshTarget {
    let (hostname, port) = if overlay {
        let address = server
            .wireguard_ip
            .clone()
            .unwrap_or_else(|| server.ssh_hostname.clone());
        (address, 22)
    } else {
        (server.ssh_hostname.clone(), server.ssh_port)
    };
    SshTarget::new(
        hostname,
        port,
        &server.ssh_user,
        workspace.key_path(&server.ssh_key),
    )
}

// ============================================================================
// SSH transport
// ============================================================================

/// The agent executable, content-addressed
#[derive(Debug, Clone)]
pub struct AgentBinary {
    bytes: Arc<Vec<u8>>,
    hash: String,
}

impl AgentBinary {
    /// The running executable
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("Could not locate the running executable")?;
        Self::from_path(&exe)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Could not read agent {}", path.display()))?;
        let hash = blake3::hash(&bytes).to_hex().to_string();
        Ok(Self {
            bytes: Arc::new(bytes),
            hash,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// File name of this build on a host
    pub fn file_name(&self) -> String {
        format!("convoy-agent-{}", &self.hash[..16])
    }

    /// Path of this build inside `dir` on a host
    pub fn remote_path(&self, dir: &str) -> String {
        format!("{}/{}", dir.trim_end_matches('/'), self.file_name())
    }
}

/// Opens agent channels over ssh.
///
/// The agent lives under `agent_dir` on each host and is only run from there
/// when the login user alone could have written it. A dry run never installs
/// it: a missing agent is copied to a scratch directory that closing the
/// channel removes.
pub struct SshTransport {
    options: SessionOptions,
    agent: AgentBinary,
    agent_dir: String,
    dry_run: bool,
}

impl SshTransport {
    pub fn new(options: SessionOptions, agent: AgentBinary, agent_dir: impl Into<String>) -> Self {
        Self {
            options,
            agent,
            agent_dir: agent_dir.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Where to run the agent from, uploading it if needed
    fn install(&self, session: &Session) -> Result<(String, Option<String>)> {
        let endpoint = session.target().endpoint();
        let agent_path = self.agent.remote_path(&self.agent_dir);
        if session.is_trusted_executable(&agent_path)? {
            return Ok((agent_path, None));
        }
        if self.dry_run {
            log::info!("Uploading agent to a scratch directory on {endpoint}");
            let name = self.agent.file_name();
            let scratch = session.upload_scratch(&self.agent.bytes, &name)?;
            return Ok((format!("{scratch}/{name}"), Some(scratch)));
        }
        log::info!("Uploading agent to {endpoint}");
        session
            .upload(&self.agent.bytes, &agent_path)
            .with_context(|| format!("Could not install the agent in {}", self.agent_dir))?;
        Ok((agent_path, None))
    }
}

impl Transport for SshTransport {
    fn open(&self, target: &SshTarget) -> Result<Arc<dyn AgentChannel>> {
        let session = Session::connect(target.clone(), &self.options)?;
        let (agent_path, scratch) = self.install(&session)?;

        let session = if target.is_privileged() {
            session
        } else {
            session.escalate()
        };
        Ok(Arc::new(SshChannel {
            session,
            agent_path,
            scratch,
        }))
    }
}

struct SshChannel {
    session: Session,
    agent_path: String,
    /// Temporary upload to remove on close
    scratch: Option<String>,
}

impl AgentChannel for SshChannel {
    fn call(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let payload = serde_json::to_vec(request)?;
        let command = format!(
            "env {ENV_DRY_RUN}={} {} {AGENT_SUBCOMMAND}",
            request.dry_run,
            shell_quote(&self.agent_path)
        );
        let output = self.session.exec_checked(&command, &payload)?;
        serde_json::from_slice(&output.stdout).with_context(|| {
            format!(
                "Invalid agent response from {}: {}",
                self.session.target().endpoint(),
                output.stderr_str().trim()
            )
        })
    }

    fn close(&self) {
        if let Some(scratch) = &self.scratch
            && let Err(e) = self.session.remove_all(scratch)
        {
            log::warn!(
                "Could not remove {scratch} on {}: {e}",
                self.session.target().endpoint()
            );
        }
        self.session.close();
    }
}

// ============================================================================
// Connection pool
// ============================================================================

/// One channel per `host-port`, reused for every batch of a run.
///
/// Dropping the pool closes every channel.
pub struct ConnectionPool<T: Transport> {
    transport: T,
    overlay: bool,
    channels: HashMap<String, Arc<dyn AgentChannel>>,
}

impl<T: Transport> ConnectionPool<T> {
    pub fn new(transport: T, overlay: bool) -> Self {
        Self {
            transport,
            overlay,
            channels: HashMap::new(),
        }
    }

    pub fn target_for(&self, server: &ServerRecord, workspace: &Workspace) -> SshTarget {
        target_for(server, workspace, self.overlay)
    }

    /// Cached channel for `target`, opening one if needed
    pub fn channel(&mut self, target: &SshTarget) -> Result<Arc<dyn AgentChannel>> {
        let key = target.cache_key();
        if let Some(channel) = self.channels.get(&key) {
            return Ok(Arc::clone(channel));
        }
        log::debug!("Opening connection to {}", target.endpoint());
        let channel = self.transport.open(target)?;
        self.channels.insert(key, Arc::clone(&channel));
        Ok(channel)
    }

    /// Drop the channel for `target`, so the next use reconnects
    pub fn evict(&mut self, target: &SshTarget) {
        if let Some(channel) = self.channels.remove(&target.cache_key()) {
            channel.close();
        }
    }

    /// Close and forget every channel
    pub fn clear(&mut self) {
        for (key, channel) in self.channels.drain() {
            log::debug!("Closing connection {key}");
            channel.close();
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl<T: Transport> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct HostCall {
    server: String,
    target: SshTarget,
    channel: Arc<dyn AgentChannel>,
    request: AgentRequest,
}

/// Runs a batch on its hosts in parallel through a [`ConnectionPool`]
pub struct RemoteExecutor<'w, T: Transport> {
    pool: ConnectionPool<T>,
    workspace: &'w Workspace,
    inventory: &'w Inventory,
    jobs: Option<usize>,
}

impl<'w, T: Transport> RemoteExecutor<'w, T> {
    pub fn new(
        pool: ConnectionPool<T>,
        workspace: &'w Workspace,
        inventory: &'w Inventory,
        jobs: Option<usize>,
    ) -> Self {
        Self {
            pool,
            workspace,
            inventory,
            jobs,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.pool
    }
}

impl<T: Transport> Dispatcher for RemoteExecutor<'_, T> {
    /// Connect to every server first, then fire all calls at once and wait
    /// for all of them.
    fn dispatch(
        &mut self,
        servers: &[ServerRecord],
        modules: &[ModuleDescriptor],
        dry_run: bool,
    ) -> Result<DispatchResult> {
        let sources = BundleSources::collect(self.workspace, self.inventory)?;

        let mut calls = Vec::with_capacity(servers.len());
        for server in servers {
            let target = self.pool.target_for(server, self.workspace);
            let channel = self.pool.channel(&target).inspect_err(|e| {
                log::error!("Could not connect to {} ({}): {e:#}", server.name, target.endpoint());
            })?;
            calls.push(HostCall {
                server: server.name.clone(),
                target,
                channel,
                request: AgentRequest {
                    bundle: sources.bundle_for(server, self.inventory),
                    modules: modules.to_vec(),
                    dry_run,
                },
            });
        }

        let threads = self.jobs.unwrap_or(calls.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("Failed to create host thread pool")?;
        let outcomes: Vec<Result<AgentResponse>> = pool.install(|| {
            calls
                .par_iter()
                .map(|call| call.channel.call(&call.request))
                .collect()
        });

        let mut result = DispatchResult::default();
        for (call, outcome) in calls.into_iter().zip(outcomes) {
            let message = match outcome {
                Ok(AgentResponse::Completed { outputs }) => {
                    result.reports.push(HostReport {
                        server: call.server,
                        outputs,
                    });
                    continue;
                }
                Ok(AgentResponse::Failed { error }) => error,
                Err(e) => {
                    self.pool.evict(&call.target);
                    format!("{e:#}")
                }
            };
            log::error!("Got error from {}: {message}", call.target.endpoint());
            result.failures.push(HostFailure {
                server: call.server,
                endpoint: call.target.endpoint(),
                message,
            });
        }
        Ok(result)
    }
}
