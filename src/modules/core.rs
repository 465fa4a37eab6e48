//! The `core` module: facts about every host.
//!
//! Runs first everywhere. On the host it gathers the hostname, network
//! devices, users, groups and external address; back on the control node
//! it stores them as `configs/networks-<server>` and `configs/other-<server>`
//! for later modules to read.

use crate::exec::run_command_with;
use crate::fsutil;
use anyhow::{Context, Result};
use declarative::{
    CORE_MODULE, Module, ParseContext, RunContext, network_config_name, other_config_name,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

/// Where a host caches its external address between runs
const IP_CACHE: &str = "/opt/ip_address";
const IP_LOOKUP: &str = "curl -s https://api.ipify.org?format=json";

/// What `run` reports for one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub server_name: String,
    pub hostname: String,
    /// Raw `ip -j address` output
    pub network_devices: String,
    pub users: Vec<String>,
    /// Raw `getent group` output
    pub groups: String,
    pub external_ip: String,
}

pub fn module() -> Module {
    Module::new(CORE_MODULE).run(run).parse_return(parse_return)
}

fn run(ctx: &mut RunContext<'_>) -> Result<Option<Value>> {
    let dry_run = ctx.dry_run;
    let network_devices = run_command_with("ip -j address", true, dry_run)?;
    let users = parse_users(&run_command_with("getent passwd", true, dry_run)?);
    let facts = HostFacts {
        server_name: ctx.server()?.name.clone(),
        hostname: run_command_with("hostname", true, dry_run)?.trim().to_string(),
        groups: run_command_with("getent group", true, dry_run)?,
        external_ip: external_ip(&network_devices, &users, dry_run)?,
        network_devices,
        users,
    };
    Ok(Some(serde_json::to_value(facts)?))
}

fn parse_return(ctx: &mut ParseContext<'_>, results: &[Value]) -> Result<()> {
    let Some(info) = results.first() else {
        return Ok(());
    };
    let facts: HostFacts =
        serde_json::from_value(info.clone()).context("Malformed core facts")?;
    let networks: Value = serde_json::from_str(&facts.network_devices)
        .with_context(|| format!("Malformed network devices from {}", facts.server_name))?;

    store(ctx.config_dir, &facts, &networks, ctx.dry_run)
}

fn store(config_dir: &Path, facts: &HostFacts, networks: &Value, dry_run: bool) -> Result<()> {
    let name = &facts.server_name;
    fsutil::set_json_contents(&config_dir.join(network_config_name(name)), networks, dry_run)?;

    let other = json!({
        "external_ip": facts.external_ip,
        "users": facts.users,
        "groups": facts.groups,
        "hostname": facts.hostname,
    });
    fsutil::set_json_contents(&config_dir.join(other_config_name(name)), &other, dry_run)?;
    Ok(())
}

/// Sorted user names from `getent passwd`
fn parse_users(passwd: &str) -> Vec<String> {
    let mut users: Vec<String> = passwd
        .lines()
        .filter_map(|line| line.split(':').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    users.sort();
    users
}

/// The host's public address, cached in [`IP_CACHE`].
///
/// Containers and vagrant boxes have no useful public address, so the last
/// `eth*` interface with an address stands in.
fn external_ip(network_devices: &str, users: &[String], dry_run: bool) -> Result<String> {
    let cache = Path::new(IP_CACHE);
    if let Ok(text) = fs::read_to_string(cache)
        && let Some(ip) = ip_field(&text)
    {
        return Ok(ip);
    }

    let local = Path::new("/.dockerenv").exists() || users.iter().any(|u| u == "vagrant");
    let ip = if local {
        let networks: Value = serde_json::from_str(network_devices)?;
        interface_address(&networks).unwrap_or_else(|| "<unknown>".to_string())
    } else {
        let raw = run_command_with(IP_LOOKUP, true, dry_run)?;
        ip_field(&raw).with_context(|| format!("Unexpected address lookup reply: {raw}"))?
    };

    if dry_run {
        log::info!("Dry run: not caching external address in {IP_CACHE}");
    } else {
        fsutil::set_json_contents(cache, &json!({ "ip": ip }), false)?;
    }
    Ok(ip)
}

fn ip_field(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    value.get("ip")?.as_str().map(str::to_string)
}

/// First address of the last `eth*` interface that has one
fn interface_address(networks: &Value) -> Option<String> {
    networks
        .as_array()?
        .iter()
        .filter(|net| {
            net.get("ifname")
                .and_then(Value::as_str)
                .is_some_and(|name| name.starts_with("eth"))
        })
        .filter_map(|net| net.get("addr_info")?.as_array()?.first())
        .filter_map(|addr| addr.get("local")?.as_str())
        .last()
        .map(str::to_string)
}
