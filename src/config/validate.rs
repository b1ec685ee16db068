// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{PipedagError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = PipedagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(
            raw.engine,
            raw.cluster,
            raw.default,
            raw.task,
        ))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_engine_config(cfg)?;
    validate_tasks(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(PipedagError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.poll_interval_ms == 0 {
        return Err(PipedagError::ConfigError(
            "[engine].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.cluster.node_slots == 0 {
        return Err(PipedagError::ConfigError(
            "[cluster].node_slots must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        if task.program.trim().is_empty() {
            return Err(PipedagError::ConfigError(format!(
                "task '{name}' has an empty program"
            )));
        }
        if task.outputs.is_empty() {
            return Err(PipedagError::ConfigError(format!(
                "task '{name}' declares no output artifacts in `outputs`"
            )));
        }
        if let Some(0) = task.slots {
            return Err(PipedagError::ConfigError(format!(
                "task '{name}' requests zero slots"
            )));
        }
        for dep in task.after.iter() {
            if !cfg.task.contains_key(dep) {
                return Err(PipedagError::ConfigError(format!(
                    "task '{name}' has unknown dependency '{dep}' in `after`"
                )));
            }
            if dep == name {
                return Err(PipedagError::ConfigError(format!(
                    "task '{name}' cannot depend on itself in `after`"
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> task. A toposort failure means a cycle.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.task.keys() {
        graph.add_node(name.as_str());
    }

    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(PipedagError::DependencyCycle(format!(
                "cycle detected in task dependencies involving task '{node}'"
            )))
        }
    }
}

/// Dependency-respecting submission order for a validated config.
///
/// Dependencies come before their dependents; ties break on task name so
/// the order is deterministic.
pub fn topo_order(cfg: &ConfigFile) -> Vec<String> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    // BTreeMap iteration gives deterministic node insertion order.
    for name in cfg.task.keys() {
        graph.add_node(name.as_str());
    }
    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    toposort(&graph, None)
        .expect("config was validated acyclic")
        .into_iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::TaskConfig;
    use std::collections::BTreeMap;

    fn raw_with_tasks(tasks: &[(&str, &str, &[&str])]) -> RawConfigFile {
        let mut task = BTreeMap::new();
        for (name, program, after) in tasks {
            task.insert(
                name.to_string(),
                TaskConfig {
                    program: program.to_string(),
                    args: vec![],
                    after: after.iter().map(|s| s.to_string()).collect(),
                    slots: None,
                    memory_gb: None,
                    timeout_secs: None,
                    working_dir: None,
                    results_dir: None,
                    scratch_dir: None,
                    outputs: vec!["*.out".to_string()],
                    env: BTreeMap::new(),
                    instances: vec![],
                    on_cluster: false,
                },
            );
        }
        RawConfigFile {
            engine: Default::default(),
            cluster: Default::default(),
            default: Default::default(),
            task,
        }
    }

    #[test]
    fn accepts_valid_dag() {
        let raw = raw_with_tasks(&[("a", "echo", &[]), ("b", "echo", &["a"])]);
        let cfg = ConfigFile::try_from(raw).unwrap();
        assert_eq!(topo_order(&cfg), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejects_empty_task_table() {
        let raw = raw_with_tasks(&[]);
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(PipedagError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let raw = raw_with_tasks(&[("a", "echo", &["ghost"])]);
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(PipedagError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_cycle() {
        let raw = raw_with_tasks(&[("a", "echo", &["b"]), ("b", "echo", &["a"])]);
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(PipedagError::DependencyCycle(_))
        ));
    }

    #[test]
    fn rejects_missing_outputs() {
        let mut raw = raw_with_tasks(&[("a", "echo", &[])]);
        raw.task.get_mut("a").unwrap().outputs.clear();
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(PipedagError::ConfigError(_))
        ));
    }
}
