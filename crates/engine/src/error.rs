use serde::Serialize;

use crate::verify::Mismatch;

/// Result of one step of a path.
pub type StepResult<T> = Result<T, Failure>;

/// Why a path or a probe did not pass.
///
/// Failures are captured into the report of the path that produced them and
/// never propagate to sibling paths.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// A dependency resolver of `state` failed; the path was aborted before
    /// any transition was attempted.
    #[error("dependency '{name}' of state '{state}' failed: {cause}")]
    DependencyResolution {
        state: String,
        name: String,
        cause: String,
    },

    /// The setup action declared on an edge failed.
    #[error("precondition of '{state}' -> '{edge}' failed: {cause}")]
    Precondition {
        state: String,
        edge: String,
        cause: String,
    },

    /// A valid edge's action or effect failed.
    #[error("transition '{state}' -> '{edge}' failed: {cause}")]
    Transition {
        state: String,
        edge: String,
        cause: String,
    },

    /// The effect succeeded but one or more post-conditions did not hold.
    #[error(
        "expectation of '{state}' -> '{edge}' failed: {}",
        describe_mismatches(.mismatches)
    )]
    Expectation {
        state: String,
        edge: String,
        mismatches: Vec<Mismatch>,
    },

    /// An invalid transition was accepted by the external system.
    #[error("invalid transition '{label}' from state '{state}' unexpectedly succeeded")]
    UnexpectedSuccess { state: String, label: String },

    /// The run deadline expired while this path was still in flight.
    #[error("traversal timed out in state '{state}'")]
    TraversalTimeout { state: String },

    /// The path grew past the configured depth bound.
    #[error("path exceeded maximum depth {max_depth} at state '{state}'")]
    DepthExceeded { state: String, max_depth: usize },
}

impl Failure {
    /// Stable snake_case name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::DependencyResolution { .. } => "dependency_resolution",
            Failure::Precondition { .. } => "precondition",
            Failure::Transition { .. } => "transition",
            Failure::Expectation { .. } => "expectation",
            Failure::UnexpectedSuccess { .. } => "unexpected_success",
            Failure::TraversalTimeout { .. } => "traversal_timeout",
            Failure::DepthExceeded { .. } => "depth_exceeded",
        }
    }

    /// The state in which the failure was observed.
    pub fn state(&self) -> &str {
        match self {
            Failure::DependencyResolution { state, .. }
            | Failure::Precondition { state, .. }
            | Failure::Transition { state, .. }
            | Failure::Expectation { state, .. }
            | Failure::UnexpectedSuccess { state, .. }
            | Failure::TraversalTimeout { state }
            | Failure::DepthExceeded { state, .. } => state,
        }
    }
}

fn describe_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| format!("{} (expected {}, got {})", m.assertion, m.expected, m.actual))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expectation_failure_lists_every_mismatch() {
        let failure = Failure::Expectation {
            state: "active".to_string(),
            edge: "courtesyCall".to_string(),
            mismatches: vec![
                Mismatch {
                    assertion: "event CourtesyCalled".to_string(),
                    expected: json!({}),
                    actual: json!(null),
                },
                Mismatch {
                    assertion: "current state".to_string(),
                    expected: json!(8),
                    actual: json!(4),
                },
            ],
        };

        assert_eq!(
            failure.to_string(),
            "expectation of 'active' -> 'courtesyCall' failed: \
             event CourtesyCalled (expected {}, got null); current state (expected 8, got 4)"
        );
        assert_eq!(failure.kind(), "expectation");
        assert_eq!(failure.state(), "active");
    }

    #[test]
    fn failures_serialize_with_kind_tag() {
        let failure = Failure::UnexpectedSuccess {
            state: "awaitingSignerSetup".to_string(),
            label: "signerSetupFailure too early".to_string(),
        };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["kind"], "unexpected_success");
        assert_eq!(value["label"], "signerSetupFailure too early");
    }
}
