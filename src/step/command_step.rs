// src/step/command_step.rs

//! Generic external-executable step.
//!
//! Wraps any command-line tool as a [`Step`]: directories come from the
//! task's declared [`StepDirs`], the invocation is rendered
//! deterministically from the task's canonical arguments, and readiness is
//! a glob probe over the declared output artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::errors::{PipedagError, Result};
use crate::step::{Step, StepDirs, StepScript};
use crate::task::TaskRecord;

#[derive(Debug)]
pub struct CommandStep {
    program: String,
    dirs: StepDirs,
    /// Declared output artifact patterns, relative to the results dir.
    output_patterns: Vec<String>,
    outputs: GlobSet,
    extra_env: BTreeMap<String, String>,
    /// Per-instance argument lines for array-style invocations.
    instance_records: Vec<String>,
}

impl CommandStep {
    pub fn new(
        program: impl Into<String>,
        dirs: StepDirs,
        output_patterns: Vec<String>,
        extra_env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &output_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                PipedagError::Validation(format!("invalid output pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let outputs = builder
            .build()
            .map_err(|e| PipedagError::Validation(format!("building output globs: {e}")))?;

        Ok(Self {
            program: program.into(),
            dirs,
            output_patterns,
            outputs,
            extra_env,
            instance_records: Vec::new(),
        })
    }

    /// Declare per-instance configuration records for an array-style
    /// invocation. Each record is one line handed to the tool by index.
    pub fn with_instance_records(mut self, records: Vec<String>) -> Self {
        self.instance_records = records;
        self
    }

    pub fn dirs(&self) -> &StepDirs {
        &self.dirs
    }

    /// Paths under the results dir that match the declared artifact globs.
    fn matched_artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut matched = Vec::new();
        if !self.dirs.results_dir.is_dir() {
            return Ok(matched);
        }
        collect_matches(
            &self.dirs.results_dir,
            &self.dirs.results_dir,
            &self.outputs,
            &mut matched,
        )?;
        matched.sort();
        Ok(matched)
    }
}

fn collect_matches(
    root: &Path,
    dir: &Path,
    globs: &GlobSet,
    out: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {dir:?}"))? {
        let entry = entry.map_err(anyhow::Error::from)?;
        let path = entry.path();
        if path.is_dir() {
            collect_matches(root, &path, globs, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            if globs.is_match(relative) {
                out.push(path);
            }
        }
    }
    Ok(())
}

impl Step for CommandStep {
    fn prepare(&self, task: &TaskRecord) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(PipedagError::Validation(format!(
                "task '{}' has an empty program",
                task.name
            )));
        }
        if self.output_patterns.is_empty() {
            return Err(PipedagError::Validation(format!(
                "task '{}' declares no output artifacts",
                task.name
            )));
        }
        if task.resources.slots == 0 {
            return Err(PipedagError::Validation(format!(
                "task '{}' requests zero processing slots",
                task.name
            )));
        }

        self.dirs.create_all()?;
        debug!(task = %task.name, program = %self.program, "step prepared");
        Ok(())
    }

    fn environment(&self, task: &TaskRecord) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();

        // Library search path passes through from the submitting process.
        if let Ok(lib_path) = std::env::var("LD_LIBRARY_PATH") {
            env.entry("LD_LIBRARY_PATH".to_string()).or_insert(lib_path);
        }

        // Resource-limit hints derived from the requested slots.
        env.insert(
            "OMP_NUM_THREADS".to_string(),
            task.resources.slots.to_string(),
        );
        env.insert(
            "PIPEDAG_MEMORY_GB".to_string(),
            task.resources.memory_gb.to_string(),
        );

        env
    }

    fn render(&self, task: &TaskRecord) -> Result<StepScript> {
        Ok(StepScript {
            program: self.program.clone(),
            args: task.args.clone(),
            env: self.environment(task),
            working_dir: self.dirs.working_dir.clone(),
            stdout_path: task.stdout_path.clone(),
            stderr_path: task.stderr_path.clone(),
            config_records: self.instance_records.clone(),
        })
    }

    fn finalize(&self, task: &TaskRecord) -> Result<()> {
        debug!(task = %task.name, "promoting scratch artifacts");
        self.dirs.promote_scratch()
    }

    fn check_ready(&self, _task: &TaskRecord) -> Result<bool> {
        // Every declared pattern must have at least one artifact present.
        // A missing results dir simply means "not ready yet".
        if !self.dirs.results_dir.is_dir() {
            return Ok(false);
        }

        let matched = self.matched_artifacts()?;
        let all_present = self.output_patterns.iter().all(|pattern| {
            let glob = match Glob::new(pattern) {
                Ok(g) => g.compile_matcher(),
                Err(_) => return false,
            };
            matched.iter().any(|path| {
                path.strip_prefix(&self.dirs.results_dir)
                    .map(|rel| glob.is_match(rel))
                    .unwrap_or(false)
            })
        });

        Ok(all_present)
    }

    fn cleanup(&self) -> Result<()> {
        self.dirs.remove_scratch()
    }

    fn collect_result(&self, task: &TaskRecord) -> Result<serde_json::Value> {
        let artifacts: Vec<String> = self
            .matched_artifacts()?
            .into_iter()
            .map(|p| p.display().to_string())
            .collect();

        if artifacts.is_empty() {
            return Err(PipedagError::ProcessFailed {
                task: task.name.clone(),
                diagnostic: "no declared output artifacts were produced".to_string(),
            });
        }

        Ok(serde_json::json!({
            "artifacts": artifacts,
            "results_dir": self.dirs.results_dir.display().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn step_in(tmp: &TempDir, patterns: &[&str]) -> CommandStep {
        let dirs = StepDirs::new(
            tmp.path().join("work"),
            tmp.path().join("results"),
            Some(tmp.path().join("scratch")),
        );
        CommandStep::new(
            "convert",
            dirs,
            patterns.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn task() -> TaskRecord {
        TaskRecord::new("convert", "owner", vec!["in.tif".into(), "out.zarr".into()])
    }

    #[test]
    fn prepare_creates_directories_and_validates() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &["*.zarr"]);
        step.prepare(&task()).unwrap();

        assert!(tmp.path().join("work").is_dir());
        assert!(tmp.path().join("results").is_dir());
        assert!(tmp.path().join("scratch").is_dir());
    }

    #[test]
    fn prepare_fails_fast_without_outputs() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &[]);
        let err = step.prepare(&task());
        assert!(matches!(err, Err(PipedagError::Validation(_))));
    }

    #[test]
    fn check_ready_tolerates_missing_results_dir() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &["*.zarr"]);
        // prepare never ran; probe must report "not ready", not error.
        assert!(!step.check_ready(&task()).unwrap());
    }

    #[test]
    fn check_ready_and_collect_see_artifacts() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &["*.zarr"]);
        step.prepare(&task()).unwrap();

        assert!(!step.check_ready(&task()).unwrap());
        fs::write(tmp.path().join("results").join("out.zarr"), b"data").unwrap();
        assert!(step.check_ready(&task()).unwrap());

        let result = step.collect_result(&task()).unwrap();
        let artifacts = result["artifacts"].as_array().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].as_str().unwrap().ends_with("out.zarr"));
    }

    #[test]
    fn finalize_promotes_scratch_outputs() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &["*.zarr"]);
        step.prepare(&task()).unwrap();

        fs::write(tmp.path().join("scratch").join("out.zarr"), b"data").unwrap();
        assert!(!step.check_ready(&task()).unwrap());

        step.finalize(&task()).unwrap();
        assert!(step.check_ready(&task()).unwrap());
    }

    #[test]
    fn render_is_deterministic_over_task_args() {
        let tmp = TempDir::new().unwrap();
        let step = step_in(&tmp, &["*.zarr"]);
        let t = task();

        let a = step.render(&t).unwrap();
        let b = step.render(&t).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.args, vec!["in.tif".to_string(), "out.zarr".to_string()]);
        assert_eq!(a.env["OMP_NUM_THREADS"], "1");
    }
}
