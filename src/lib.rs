// src/lib.rs

pub mod cli;
pub mod cluster;
pub mod compute;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod step;
pub mod task;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::cli::CliArgs;
use crate::compute::Computation;
use crate::config::loader::load_and_validate;
use crate::config::{topo_order, ConfigFile, TaskConfig};
use crate::engine::{EngineSettings, ServiceEngine};
use crate::errors::PipedagError;
use crate::exec::{LocalProcessRunner, ProcessRunner};
use crate::step::{CommandStep, ErrorClassifier, PatternClassifier, Step, StepDirs};
use crate::task::{
    InMemoryTaskStore, ResourceRequest, TaskId, TaskRecord, TaskService, TaskStore,
};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the task store, task service and service engine
/// - a local process runner and the standard error classifier
/// - pipeline submission (all tasks, or the subgraph rooted at `--task`)
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let service = TaskService::new(store, cfg.engine.canceled_dependency_policy);
    let runner: Arc<dyn ProcessRunner> = Arc::new(LocalProcessRunner::new());
    let classifier: Arc<dyn ErrorClassifier> = Arc::new(PatternClassifier::standard());
    let engine = ServiceEngine::new(
        service,
        runner,
        classifier,
        EngineSettings {
            poll: cfg.poll_settings(),
        },
    );

    let selected = match &args.task {
        Some(root) => Some(subgraph_with_ancestors(&cfg, root)?),
        None => None,
    };

    // Submit in dependency order so each record can reference the
    // store-assigned identities of its dependencies.
    let mut ids: HashMap<String, TaskId> = HashMap::new();
    let mut pending: Vec<Computation<String>> = Vec::new();

    for name in topo_order(&cfg) {
        if let Some(selected) = &selected {
            if !selected.contains(&name) {
                continue;
            }
        }

        let tc = &cfg.task[&name];
        if tc.on_cluster {
            // The CLI has no batch scheduler bound; cluster-backed tasks
            // need the library API with a real scheduler collaborator.
            warn!(task = %name, "no batch scheduler bound; running cluster task locally");
        }

        let record = build_record(&cfg, &name, tc, &ids);
        let record = engine.task_service().submit_dependency_if_not_found(record)?;
        ids.insert(name.clone(), record.id);

        let step: Arc<dyn Step> = Arc::new(build_step(&name, tc)?);
        pending.push(engine.submit(record, step).map(|record| record.name));
    }

    info!(tasks = pending.len(), "pipeline submitted");

    let finished = Computation::combine_all(pending, |names| names)
        .await_result()
        .await?;

    info!(tasks = ?finished, "pipeline complete");
    Ok(())
}

/// The named task plus the transitive closure of its dependencies.
fn subgraph_with_ancestors(cfg: &ConfigFile, root: &str) -> Result<HashSet<String>> {
    if !cfg.task.contains_key(root) {
        return Err(anyhow!("--task '{root}' is not defined in the config"));
    }

    let mut selected = HashSet::new();
    let mut stack = vec![root.to_string()];
    while let Some(name) = stack.pop() {
        if !selected.insert(name.clone()) {
            continue;
        }
        if let Some(tc) = cfg.task.get(&name) {
            stack.extend(tc.after.iter().cloned());
        }
    }
    Ok(selected)
}

fn run_dirs(name: &str, tc: &TaskConfig) -> StepDirs {
    let base = PathBuf::from("runs").join(name);
    StepDirs::new(
        tc.working_dir.clone().unwrap_or_else(|| base.join("work")),
        tc.results_dir
            .clone()
            .unwrap_or_else(|| base.join("results")),
        tc.scratch_dir.clone(),
    )
}

fn build_record(
    cfg: &ConfigFile,
    name: &str,
    tc: &TaskConfig,
    ids: &HashMap<String, TaskId>,
) -> TaskRecord {
    let dirs = run_dirs(name, tc);

    let mut record = TaskRecord::new(name, cfg.engine.owner.clone(), tc.args.clone());
    record.resources = ResourceRequest {
        slots: tc.effective_slots(&cfg.default),
        memory_gb: tc.effective_memory_gb(&cfg.default),
        timeout: tc.effective_timeout(&cfg.default),
    };
    record.stdout_path = Some(dirs.working_dir.join(format!("{name}.out")));
    record.stderr_path = Some(dirs.working_dir.join(format!("{name}.err")));
    // Dependencies were submitted first (topological order), so their
    // identities are known here.
    record.dependencies = tc
        .after
        .iter()
        .filter_map(|dep| ids.get(dep).copied())
        .collect();
    record
}

fn build_step(name: &str, tc: &TaskConfig) -> std::result::Result<CommandStep, PipedagError> {
    let step = CommandStep::new(
        tc.program.clone(),
        run_dirs(name, tc),
        tc.outputs.clone(),
        tc.env.clone(),
    )?;
    Ok(step.with_instance_records(tc.instances.clone()))
}

/// Simple dry-run output: print tasks, deps and programs.
fn print_dry_run(cfg: &ConfigFile) {
    println!("pipedag dry-run");
    println!(
        "  engine.poll_interval_ms = {}",
        cfg.engine.poll_interval_ms
    );
    println!("  engine.poll_timeout_ms = {}", cfg.engine.poll_timeout_ms);
    println!(
        "  engine.canceled_dependency_policy = {:?}",
        cfg.engine.canceled_dependency_policy
    );
    println!();

    println!("tasks ({}):", cfg.task.len());
    for (name, task) in cfg.task.iter() {
        println!("  - {name}");
        println!("      program: {}", task.program);
        if !task.args.is_empty() {
            println!("      args: {:?}", task.args);
        }
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
        if !task.outputs.is_empty() {
            println!("      outputs: {:?}", task.outputs);
        }
        if task.on_cluster {
            println!("      on_cluster: true");
        }
        if let Some(slots) = task.slots {
            println!("      slots: {slots}");
        }
        if let Some(timeout) = task.timeout_secs {
            println!("      timeout_secs: {timeout}");
        }
    }
}
