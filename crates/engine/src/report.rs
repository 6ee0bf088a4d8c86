//! Traversal results.
//!
//! Every path from the root is recorded as a [`PathReport`] and every probe
//! as a [`ProbeReport`]. A [`RunReport`] collects both, ordered depth-first in
//! declaration order.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::context::Context;
use crate::error::Failure;
use crate::graph::GraphWarning;
use crate::probe::ProbeOutcome;

/// One transition taken (or attempted) along a path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub state: String,
    pub edge: String,
    pub target: String,
    /// Set once the effect was confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// How a path ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PathStatus {
    /// The path reached `terminal`. `revisited` marks a path that closed a
    /// cycle instead of reaching a state without edges.
    Completed { terminal: String, revisited: bool },
    /// The path failed at step index `at`.
    Failed { at: usize, failure: Failure },
}

/// The record of one path through the graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathReport {
    pub root: String,
    pub steps: Vec<Step>,
    #[serde(flatten)]
    pub status: PathStatus,
    /// Context at the point the path concluded.
    pub context: Context,
}

impl PathReport {
    pub fn passed(&self) -> bool {
        matches!(self.status, PathStatus::Completed { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            PathStatus::Failed { failure, .. } => Some(failure),
            PathStatus::Completed { .. } => None,
        }
    }

    /// Root followed by alternating edge labels and target states.
    pub fn trace(&self) -> Vec<&str> {
        let mut trace = vec![self.root.as_str()];
        for step in &self.steps {
            trace.push(&step.edge);
            trace.push(&step.target);
        }
        trace
    }
}

/// The record of one invalid transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub state: String,
    pub label: String,
    /// Trace of the path on which the probe was attempted.
    pub path: Vec<String>,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }
}

/// Aggregated result of a traversal.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub root: String,
    pub paths: Vec<PathReport>,
    pub probes: Vec<ProbeReport>,
    pub warnings: Vec<GraphWarning>,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
}

impl RunReport {
    /// True when every path completed and every probe was rejected.
    pub fn passed(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn failure_count(&self) -> usize {
        self.paths.iter().filter(|p| !p.passed()).count()
            + self.probes.iter().filter(|p| !p.passed()).count()
    }

    /// Every failure in report order.
    pub fn failures(&self) -> Vec<&Failure> {
        self.paths
            .iter()
            .filter_map(PathReport::failure)
            .chain(self.probes.iter().filter_map(|p| p.outcome.failure()))
            .collect()
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "Traversal: {}/{} paths passed, {}/{} probes rejected",
            self.paths.iter().filter(|p| p.passed()).count(),
            self.paths.len(),
            self.probes.iter().filter(|p| p.passed()).count(),
            self.probes.len()
        )
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for path in &self.paths {
            if let Some(failure) = path.failure() {
                writeln!(f, "  FAIL [{}]: {}", path.trace().join(" -> "), failure)?;
            }
        }
        for probe in &self.probes {
            if let Some(failure) = probe.outcome.failure() {
                writeln!(f, "  FAIL [{}/{}]: {}", probe.state, probe.label, failure)?;
            }
        }
        Ok(())
    }
}

fn as_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(state: &str, edge: &str, target: &str) -> Step {
        Step {
            state: state.to_string(),
            edge: edge.to_string(),
            target: target.to_string(),
            tx_hash: Some("0x00".to_string()),
        }
    }

    fn report() -> RunReport {
        RunReport {
            root: "start".to_string(),
            paths: vec![
                PathReport {
                    root: "start".to_string(),
                    steps: vec![step("start", "toX", "X")],
                    status: PathStatus::Completed {
                        terminal: "X".to_string(),
                        revisited: false,
                    },
                    context: Context::new(),
                },
                PathReport {
                    root: "start".to_string(),
                    steps: vec![step("start", "toY", "Y")],
                    status: PathStatus::Failed {
                        at: 0,
                        failure: Failure::Transition {
                            state: "start".to_string(),
                            edge: "toY".to_string(),
                            cause: "reverted: nope".to_string(),
                        },
                    },
                    context: Context::new(),
                },
            ],
            probes: vec![ProbeReport {
                state: "start".to_string(),
                label: "early".to_string(),
                path: vec!["start".to_string()],
                outcome: ProbeOutcome::Rejected {
                    cause: "reverted".to_string(),
                },
            }],
            warnings: vec![],
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn trace_alternates_edges_and_states() {
        let report = report();
        assert_eq!(report.paths[0].trace(), vec!["start", "toX", "X"]);
    }

    #[test]
    fn display_lists_summary_then_failures() {
        let text = report().to_string();
        assert_eq!(
            text,
            "Traversal: 1/2 paths passed, 1/1 probes rejected\n  \
             FAIL [start -> toY -> Y]: transition 'start' -> 'toY' failed: reverted: nope\n"
        );
    }

    #[test]
    fn counts_failures_across_paths_and_probes() {
        let report = report();
        assert!(!report.passed());
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.failures()[0].kind(), "transition");
    }

    #[test]
    fn json_flattens_status() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["paths"][0]["status"], "completed");
        assert_eq!(value["paths"][1]["failure"]["kind"], "transition");
        assert_eq!(value["probes"][0]["outcome"], "rejected");
        assert_eq!(value["elapsed_secs"], 1.5);
    }
}
