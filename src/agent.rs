//! Host side of the run phase.
//!
//! `convoy agent` reads one [`AgentRequest`] from stdin, runs the requested
//! modules and writes one [`AgentResponse`] to stdout. Stdout carries
//! nothing else; logs go to stderr.

use crate::remote::{AgentRequest, AgentResponse};
use anyhow::{Context, Result};
use declarative::{ModuleRegistry, run_modules};
use std::io::{Read, Write};

/// Serve a single request on stdin/stdout
pub fn serve(registry: &ModuleRegistry) -> Result<()> {
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("Failed to read agent request")?;

    let response = match serde_json::from_slice::<AgentRequest>(&input) {
        Ok(request) => handle(registry, &request),
        Err(e) => AgentResponse::Failed {
            error: format!("Invalid agent request: {e}"),
        },
    };

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response).context("Failed to write agent response")?;
    stdout.flush()?;
    Ok(())
}

/// Run a request's modules against its bundle
pub fn handle(registry: &ModuleRegistry, request: &AgentRequest) -> AgentResponse {
    let host = request
        .bundle
        .host
        .as_ref()
        .map(|h| h.name.as_str())
        .unwrap_or("<unknown>");
    log::info!(
        "Agent on {host}: {} module(s){}",
        request.modules.len(),
        if request.dry_run { " (dry run)" } else { "" }
    );

    match run_modules(registry, &request.bundle, &request.modules, request.dry_run) {
        Ok(outputs) => AgentResponse::Completed { outputs },
        Err(e) => {
            log::error!("Agent on {host} failed: {e:#}");
            AgentResponse::Failed {
                error: format!("{e:#}"),
            }
        }
    }
}
