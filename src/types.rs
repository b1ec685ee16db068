// src/types.rs

use std::str::FromStr;

use serde::Deserialize;

/// How a dependency that terminated in `Canceled` propagates to its parent.
///
/// - `Failure`: a canceled dependency blocks the parent exactly like an
///   errored one (default behaviour).
/// - `Success`: a canceled dependency is treated as satisfied, so the parent
///   may still become eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanceledDependencyPolicy {
    Success,
    Failure,
}

impl Default for CanceledDependencyPolicy {
    fn default() -> Self {
        CanceledDependencyPolicy::Failure
    }
}

impl FromStr for CanceledDependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" => Ok(CanceledDependencyPolicy::Success),
            "failure" => Ok(CanceledDependencyPolicy::Failure),
            other => Err(format!(
                "invalid canceled_dependency_policy: {other} (expected \"success\" or \"failure\")"
            )),
        }
    }
}
