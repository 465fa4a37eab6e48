//! Batch execution: the three-phase protocol.
//!
//! For each batch: `local` runs once per module on the control node, the
//! dispatcher carries the modules to every host and runs them there, and
//! `parse_return` runs on the control node once per host result. Any host
//! failure aborts the run after all hosts of the batch have reported.

use crate::context::{
    Dispatcher, LocalContext, ParseContext, ProgressCallback, RoleResolver, RunContext,
    SelectorSink, merge_json,
};
use crate::descriptor::ModuleDescriptor;
use crate::error::Error;
use crate::module::ModuleRegistry;
use crate::planner::{Batch, RunPlan};
use crate::selector;
use crate::types::{BatchSummary, ExecuteSummary, HostBundle, Inventory, Phase, ServerRecord};
use anyhow::Result;
use serde_json::Value;
use std::path::Path;

/// Control-node settings shared by every batch of a run
#[derive(Debug, Clone, Copy)]
pub struct PhaseEnv<'a> {
    pub inventory: &'a Inventory,
    pub config_dir: &'a Path,
    pub dry_run: bool,
}

/// Execute every batch of a plan, in order
pub fn execute<D, S, P>(
    plan: &RunPlan,
    registry: &ModuleRegistry,
    env: &PhaseEnv<'_>,
    dispatcher: &mut D,
    selectors: &mut S,
    progress: &mut P,
) -> Result<ExecuteSummary>
where
    D: Dispatcher,
    S: SelectorSink + RoleResolver,
    P: ProgressCallback,
{
    let batches = plan.batches();
    let mut summary = ExecuteSummary::default();

    for (index, batch) in batches.iter().enumerate() {
        progress.on_batch_start(index, batches.len(), batch);
        let done = execute_batch(batch, registry, env, dispatcher, selectors, progress)?;
        progress.on_batch_complete(batch, &done);
        summary.add(&done);
    }

    Ok(summary)
}

/// Run one batch through local, run and parse_return
pub fn execute_batch<D, S, P>(
    batch: &Batch,
    registry: &ModuleRegistry,
    env: &PhaseEnv<'_>,
    dispatcher: &mut D,
    selectors: &mut S,
    progress: &mut P,
) -> Result<BatchSummary>
where
    D: Dispatcher,
    S: SelectorSink + RoleResolver,
    P: ProgressCallback,
{
    let servers = batch
        .servers
        .iter()
        .map(|name| {
            env.inventory
                .server(name)
                .cloned()
                .ok_or_else(|| Error::UnknownServer { name: name.clone() })
        })
        .collect::<std::result::Result<Vec<ServerRecord>, Error>>()?;

    for descriptor in &batch.modules {
        let module = registry.get(&descriptor.name)?;
        if !module.capabilities().local {
            continue;
        }
        progress.on_phase(Phase::Local, descriptor);
        let mut ctx = LocalContext {
            options: &descriptor.options,
            inventory: env.inventory,
            config_dir: env.config_dir,
            dry_run: env.dry_run,
            roles: &mut *selectors,
        };
        module
            .call_local(&mut ctx)
            .map_err(|e| Error::lifecycle(descriptor, Phase::Local, &e))?;
    }

    for descriptor in &batch.modules {
        progress.on_phase(Phase::Run, descriptor);
    }
    let result = dispatcher.dispatch(&servers, &batch.modules, env.dry_run)?;
    if !result.failures.is_empty() {
        progress.on_failures(&result.failures);
        return Err(Error::RemoteFailures {
            phase: Phase::Run,
            failures: result.failures,
        }
        .into());
    }

    let mut decisions = 0;
    for report in &result.reports {
        let server = env
            .inventory
            .server(&report.server)
            .ok_or_else(|| Error::UnknownServer {
                name: report.server.clone(),
            })?;
        if report.outputs.len() != batch.modules.len() {
            return Err(Error::Protocol(format!(
                "{} returned {} output(s) for {} module(s)",
                report.server,
                report.outputs.len(),
                batch.modules.len()
            ))
            .into());
        }

        for (descriptor, output) in batch.modules.iter().zip(&report.outputs) {
            let module = registry.get(&descriptor.name)?;
            if module.capabilities().parse_return {
                progress.on_phase(Phase::ParseReturn, descriptor);
                let mut ctx = ParseContext {
                    options: &descriptor.options,
                    inventory: env.inventory,
                    config_dir: env.config_dir,
                    server,
                    dry_run: env.dry_run,
                    roles: &mut *selectors,
                };
                let results: &[Value] = if output.is_null() {
                    &[]
                } else {
                    std::slice::from_ref(output)
                };
                module
                    .call_parse_return(&mut ctx, results)
                    .map_err(|e| Error::lifecycle(descriptor, Phase::ParseReturn, &e))?;
            }

            let found = selector::decisions_in(output);
            if !found.is_empty() {
                log::debug!("{} picked {:?}", report.server, found);
                decisions += found.len();
                selectors.record(&found)?;
            }
        }
    }

    Ok(BatchSummary {
        modules: batch.modules.len(),
        hosts: result.reports.len(),
        selector_decisions: decisions,
    })
}

/// Host side of the run phase: execute `modules` in order against `bundle`.
///
/// Returns one output per module. A module's queued return data is merged
/// into the object it returns; a module without a run phase yields `Null`.
pub fn run_modules(
    registry: &ModuleRegistry,
    bundle: &HostBundle,
    modules: &[ModuleDescriptor],
    dry_run: bool,
) -> Result<Vec<Value>> {
    let mut outputs = Vec::with_capacity(modules.len());

    for descriptor in modules {
        let module = registry.get(&descriptor.name)?;
        let mut ctx = RunContext::new(&descriptor.options, bundle, dry_run);
        let returned = match module.call_run(&mut ctx) {
            Some(result) => result.map_err(|e| Error::lifecycle(descriptor, Phase::Run, &e))?,
            None => {
                outputs.push(Value::Null);
                continue;
            }
        };

        let extra = ctx.take_return_data();
        let output = match returned {
            Some(Value::Object(mut map)) => {
                merge_json(&mut map, extra);
                Value::Object(map)
            }
            None => Value::Object(extra),
            Some(other) => {
                if !extra.is_empty() {
                    log::warn!(
                        "{descriptor} returned a non-object; dropping its return data: {}",
                        Value::Object(extra)
                    );
                }
                other
            }
        };
        log::debug!("Ran {descriptor}");
        outputs.push(output);
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::module::{CORE_MODULE, Module};
    use crate::resolver::Resolver;
    use crate::planner::{HostFilter, ModuleMap};
    use crate::selector::Selections;
    use crate::types::{DispatchResult, HostFailure, HostReport};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Runs modules in-process, as if every host answered
    struct Loopback<'r> {
        registry: &'r ModuleRegistry,
        inventory: Inventory,
        failing: Vec<String>,
        calls: Calls,
    }

    impl Dispatcher for Loopback<'_> {
        fn dispatch(
            &mut self,
            servers: &[ServerRecord],
            modules: &[ModuleDescriptor],
            dry_run: bool,
        ) -> Result<DispatchResult> {
            self.calls.push((
                servers.iter().map(|s| s.name.clone()).collect(),
                modules.iter().map(|m| m.name.clone()).collect(),
            ));
            let mut result = DispatchResult::default();
            for server in servers {
                if self.failing.contains(&server.name) {
                    result.failures.push(HostFailure {
                        server: server.name.clone(),
                        endpoint: format!("root@{}:22", server.name),
                        message: "boom".into(),
                    });
                    continue;
                }
                let bundle = HostBundle {
                    host: Some(server.clone()),
                    inventory: self.inventory.clone(),
                    ..HostBundle::default()
                };
                result.reports.push(HostReport {
                    server: server.name.clone(),
                    outputs: run_modules(self.registry, &bundle, modules, dry_run)?,
                });
            }
            Ok(result)
        }
    }

    #[derive(Default)]
    struct MemorySelectors(Selections);

    impl SelectorSink for MemorySelectors {
        fn record(&mut self, decisions: &Selections) -> Result<()> {
            self.0.extend(decisions.clone());
            Ok(())
        }
    }

    impl RoleResolver for MemorySelectors {
        fn resolve_role(&mut self, role: &str, servers: &[ServerRecord]) -> Result<ServerRecord> {
            let server = selector::choose(role, servers, &self.0)?.server().clone();
            self.0.insert(role.to_string(), server.name.clone());
            Ok(server)
        }
    }

    fn inventory(names: &[&str]) -> Inventory {
        Inventory {
            servers: names.iter().map(|n| ServerRecord::named(*n)).collect(),
            ..Inventory::default()
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn traced_registry(log: &Log) -> ModuleRegistry {
        let local_log = Arc::clone(log);
        let parse_log = Arc::clone(log);
        ModuleRegistry::new()
            .with(Module::new(CORE_MODULE).run(|ctx| {
                Ok(Some(json!({"hostname": ctx.server()?.name})))
            }))
            .unwrap()
            .with(
                Module::new("ntp")
                    .local(move |_| {
                        local_log.lock().unwrap().push("local ntp".into());
                        Ok(())
                    })
                    .run(|ctx| {
                        ctx.use_this_host("time")?;
                        Ok(None)
                    })
                    .parse_return(move |ctx, results| {
                        parse_log
                            .lock()
                            .unwrap()
                            .push(format!("parse ntp {} {}", ctx.server.name, results.len()));
                        Ok(())
                    }),
            )
            .unwrap()
    }

    type Calls = Vec<(Vec<String>, Vec<String>)>;

    fn run(
        registry: &ModuleRegistry,
        inventory: &Inventory,
        map: &ModuleMap,
        failing: &[&str],
    ) -> (Result<ExecuteSummary>, Calls, MemorySelectors) {
        let dir = TempDir::new().unwrap();
        let mut selectors = MemorySelectors::default();
        let mut resolver = Resolver::new(registry, inventory);
        let plan = RunPlan::build(map, inventory, &mut resolver, &mut selectors).unwrap();
        let mut loopback = Loopback {
            registry,
            inventory: inventory.clone(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            calls: Vec::new(),
        };
        let env = PhaseEnv {
            inventory,
            config_dir: dir.path(),
            dry_run: false,
        };
        let result = execute(
            &plan,
            registry,
            &env,
            &mut loopback,
            &mut selectors,
            &mut NoProgress,
        );
        (result, loopback.calls, selectors)
    }

    #[test]
    fn test_phases_in_order() {
        let log: Log = Arc::default();
        let registry = traced_registry(&log);
        let inventory = inventory(&["foo", "bar"]);
        let map = ModuleMap::from(vec![ModuleDescriptor::new("ntp")]);

        let (result, calls, selectors) = run(&registry, &inventory, &map, &[]);
        let summary = result.unwrap();

        assert_eq!(summary.batches, 1);
        assert_eq!(summary.host_calls, 2);
        assert_eq!(
            calls,
            vec![(
                vec!["bar".to_string(), "foo".to_string()],
                vec!["core".to_string(), "ntp".to_string()]
            )]
        );
        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["local ntp", "parse ntp bar 1", "parse ntp foo 1"]
        );
        // Both hosts hash "time" to the same server and report it
        assert_eq!(selectors.0.len(), 1);
        assert!(inventory.server(&selectors.0["time"]).is_some());
        assert_eq!(summary.selector_decisions, 2);
    }

    #[test]
    fn test_host_failures_abort_after_all_hosts() {
        let log: Log = Arc::default();
        let registry = traced_registry(&log);
        let inventory = inventory(&["foo", "bar", "baz"]);
        let map = ModuleMap::from(vec![ModuleDescriptor::new("ntp")]);

        let (result, calls, _) = run(&registry, &inventory, &map, &["foo", "baz"]);
        let err = result.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::RemoteFailures { phase, failures }) => {
                assert_eq!(*phase, Phase::Run);
                let names: Vec<_> = failures.iter().map(|f| f.server.as_str()).collect();
                assert_eq!(names, vec!["baz", "foo"]);
            }
            other => panic!("expected remote failures, got {other:?}"),
        }
        assert_eq!(calls.len(), 1);
        // No parse_return after a failed run
        assert_eq!(log.lock().unwrap().clone(), vec!["local ntp"]);
    }

    #[test]
    fn test_role_group_runs_on_one_host() {
        let log: Log = Arc::default();
        let registry = traced_registry(&log);
        let inventory = inventory(&["foo", "bar"]);
        let map = ModuleMap::new().group(
            HostFilter::Role("time".into()),
            vec![ModuleDescriptor::new("ntp")],
        );

        let (result, calls, selectors) = run(&registry, &inventory, &map, &[]);
        result.unwrap();
        let chosen = selectors.0["time"].clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![chosen]);
    }

    #[test]
    fn test_control_node_phases_resolve_roles() {
        let log: Log = Arc::default();
        let local_log = Arc::clone(&log);
        let parse_log = Arc::clone(&log);
        let registry = ModuleRegistry::new()
            .with(Module::new(CORE_MODULE).run(|_| Ok(None)))
            .unwrap()
            .with(
                Module::new("ca")
                    .local(move |ctx| {
                        let signer = ctx.selector("ca")?;
                        local_log.lock().unwrap().push(format!("sign on {}", signer.name));
                        Ok(())
                    })
                    .run(|_| Ok(None))
                    .parse_return(move |ctx, _| {
                        if ctx.is_selected("ca")? {
                            parse_log
                                .lock()
                                .unwrap()
                                .push(format!("collect from {}", ctx.server.name));
                        }
                        Ok(())
                    }),
            )
            .unwrap();
        let inventory = inventory(&["foo", "bar"]);
        let map = ModuleMap::from(vec![ModuleDescriptor::new("ca")]);

        let (result, _, selectors) = run(&registry, &inventory, &map, &[]);
        result.unwrap();

        // "ca" = 99 + 97 = 196, 196 % 2 = 0
        assert_eq!(selectors.0["ca"], "foo");
        assert_eq!(
            log.lock().unwrap().clone(),
            vec!["sign on foo", "collect from foo"]
        );
    }

    #[test]
    fn test_run_modules_merges_return_data() {
        let registry = ModuleRegistry::new()
            .with(Module::new("a").run(|ctx| {
                ctx.add_return_data(json!({"extra": {"x": 1}}));
                Ok(Some(json!({"extra": {"y": 2}, "value": true})))
            }))
            .unwrap()
            .with(Module::new("b").run(|ctx| {
                ctx.add_return_data(json!({"only": "data"}));
                Ok(None)
            }))
            .unwrap()
            .with(Module::new("c"))
            .unwrap()
            .with(Module::new("d").run(|_| Ok(Some(json!([1, 2])))))
            .unwrap();
        let bundle = HostBundle::default();
        let modules: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| ModuleDescriptor::new(*n))
            .collect();

        let outputs = run_modules(&registry, &bundle, &modules, true).unwrap();
        assert_eq!(
            outputs,
            vec![
                json!({"extra": {"x": 1, "y": 2}, "value": true}),
                json!({"only": "data"}),
                Value::Null,
                json!([1, 2]),
            ]
        );
    }

    #[test]
    fn test_run_modules_error_names_module() {
        let registry = ModuleRegistry::new()
            .with(Module::new("broken").run(|_| anyhow::bail!("apt failed")))
            .unwrap();
        let err = run_modules(
            &registry,
            &HostBundle::default(),
            &[ModuleDescriptor::new("broken")],
            false,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "error while running run for broken: apt failed");
    }
}
