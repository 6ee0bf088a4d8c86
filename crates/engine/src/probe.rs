//! Invalid transition probes.
//!
//! A probe runs an invalid transition and passes when the external system
//! refuses it. An unreachable system decides nothing, so it fails the probe.
//! Probes never produce a successor context or resolve a subject.

use serde::Serialize;

use crate::context::Context;
use crate::error::Failure;
use crate::execute::{attempt, transition_failure, Attempt};
use crate::graph::Probe;
use crate::ledger::{Ledger, Session};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The external system refused the transition, as required.
    Rejected { cause: String },
    /// The system accepted the transition, or it could not be attempted.
    Failed { failure: Failure },
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ProbeOutcome::Rejected { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ProbeOutcome::Rejected { .. } => None,
            ProbeOutcome::Failed { failure } => Some(failure),
        }
    }
}

/// Attempt `probe` from `state` and check that it is rejected.
///
/// `ctx` is only read; the caller's context is never extended.
pub async fn probe_invalid_transition<L: Ledger>(
    probe: &Probe<L>,
    session: &Session<L>,
    ctx: &Context,
    state: &str,
) -> ProbeOutcome {
    let label = probe.label.as_str();
    match attempt(&probe.spec, session, ctx, state, label).await {
        Ok(Attempt::Refused(e)) if e.is_outage() => {
            tracing::warn!(state, probe = label, cause = %e, "invalid transition not decided");
            ProbeOutcome::Failed {
                failure: transition_failure(state, label, e.to_string()),
            }
        }
        Ok(Attempt::Refused(e)) => {
            tracing::debug!(state, probe = label, cause = %e, "rejected as expected");
            ProbeOutcome::Rejected {
                cause: e.to_string(),
            }
        }
        Ok(Attempt::Confirmed { receipt, .. }) => {
            tracing::warn!(
                state,
                probe = label,
                tx = %receipt.tx_hash,
                "invalid transition succeeded"
            );
            ProbeOutcome::Failed {
                failure: Failure::UnexpectedSuccess {
                    state: state.to_string(),
                    label: label.to_string(),
                },
            }
        }
        Err(failure) => {
            tracing::warn!(state, probe = label, %failure, "probe could not be attempted");
            ProbeOutcome::Failed { failure }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{StateNode, Submission, TransitionSpec};
    use crate::scripted::{ScriptedCall, ScriptedLedger};
    use serde_json::json;

    fn node() -> StateNode<ScriptedLedger> {
        StateNode::new("awaitingSignerSetup")
            .reject(
                "early",
                TransitionSpec::new(|_, _| async {
                    Ok(Submission::new(ScriptedCall::emit(vec![])))
                }),
            )
            .reject(
                "guarded",
                TransitionSpec::new(|_, _| async {
                    Ok(Submission::new(ScriptedCall::revert("Signer setup timeout not elapsed")))
                }),
            )
    }

    #[tokio::test]
    async fn accepted_invalid_transition_is_unexpected_success() {
        let node = node();
        let session = Session::new(ScriptedLedger::new());
        let outcome =
            probe_invalid_transition(&node.probes()[0], &session, &Context::new(), node.name())
                .await;
        assert_eq!(
            outcome.failure(),
            Some(&Failure::UnexpectedSuccess {
                state: "awaitingSignerSetup".to_string(),
                label: "early".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn accepted_transition_with_unresolvable_subject_is_unexpected_success() {
        let spec = TransitionSpec::<ScriptedLedger>::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::emit(vec![]))
                .resolve_subject("deposit", |_| Err(anyhow::anyhow!("no Created event"))))
        });
        let node = StateNode::new("active").reject("redeem twice", spec);
        let session = Session::new(ScriptedLedger::new());

        let outcome =
            probe_invalid_transition(&node.probes()[0], &session, &Context::new(), "active").await;
        assert_eq!(
            outcome.failure(),
            Some(&Failure::UnexpectedSuccess {
                state: "active".to_string(),
                label: "redeem twice".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn unreachable_ledger_fails_the_check() {
        let spec = TransitionSpec::<ScriptedLedger>::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::Unreachable(
                "connection refused".to_string(),
            )))
        });
        let node = StateNode::new("active").reject("courtesyCall", spec);
        let session = Session::new(ScriptedLedger::new());

        let outcome =
            probe_invalid_transition(&node.probes()[0], &session, &Context::new(), "active").await;
        assert!(!outcome.passed());
        assert_eq!(
            outcome.failure(),
            Some(&Failure::Transition {
                state: "active".to_string(),
                edge: "courtesyCall".to_string(),
                cause: "ledger unavailable: connection refused".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn refused_invalid_transition_passes() {
        let node = node();
        let session = Session::new(ScriptedLedger::new());
        let ctx = Context::new().bind("deposit", json!("0xd1"));
        let outcome =
            probe_invalid_transition(&node.probes()[1], &session, &ctx, node.name()).await;
        assert!(outcome.passed());
        assert_eq!(
            outcome,
            ProbeOutcome::Rejected {
                cause: "reverted: Signer setup timeout not elapsed".to_string()
            }
        );
        assert_eq!(ctx.len(), 1);
    }

    #[tokio::test]
    async fn failing_precondition_on_invalid_transition_is_reported() {
        let spec = TransitionSpec::<ScriptedLedger>::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::revert("unused")))
        })
        .precondition(|_, _| async { Err(anyhow::anyhow!("price feed unavailable")) });
        let node = StateNode::new("active").reject("courtesyCall", spec);
        let session = Session::new(ScriptedLedger::new());

        let outcome =
            probe_invalid_transition(&node.probes()[0], &session, &Context::new(), "active").await;
        assert_eq!(outcome.failure().map(Failure::kind), Some("precondition"));
    }
}
