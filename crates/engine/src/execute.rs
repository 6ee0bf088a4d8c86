//! Transition execution: precondition, action, submission, confirmation.

use crate::context::Context;
use crate::error::{Failure, StepResult};
use crate::graph::{SubjectResolver, TransitionSpec};
use crate::ledger::{EffectError, Ledger, Receipt, Session};

/// A confirmed valid transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub receipt: Receipt,
    /// Context handed to the successor state.
    pub next: Context,
}

/// How far an attempt got before the effect was decided.
pub(crate) enum Attempt {
    /// The external system confirmed the effect. The subject resolver has
    /// not run yet.
    Confirmed {
        receipt: Receipt,
        subject: Option<(String, SubjectResolver)>,
    },
    /// The external system refused or reverted the effect.
    Refused(EffectError),
}

/// Run precondition and action, submit the operation and wait for its
/// outcome. Shared by valid edges and probes; only the interpretation of
/// [`Attempt::Refused`] differs between the two.
pub(crate) async fn attempt<L: Ledger>(
    spec: &TransitionSpec<L>,
    session: &Session<L>,
    ctx: &Context,
    state: &str,
    edge: &str,
) -> StepResult<Attempt> {
    if let Some(hook) = spec.precondition_hook() {
        hook(session.ledger(), ctx.clone())
            .await
            .map_err(|e| Failure::Precondition {
                state: state.to_string(),
                edge: edge.to_string(),
                cause: format!("{e:#}"),
            })?;
    }

    let submission = (spec.action())(session.ledger(), ctx.clone())
        .await
        .map_err(|e| transition_failure(state, edge, format!("{e:#}")))?;
    let (operation, subject) = submission.into_parts();
    tracing::debug!(state, edge, ?operation, "submitting");

    match session.submit_and_confirm(operation).await {
        Ok(receipt) => Ok(Attempt::Confirmed { receipt, subject }),
        Err(e) => Ok(Attempt::Refused(e)),
    }
}

pub(crate) fn transition_failure(state: &str, edge: &str, cause: String) -> Failure {
    Failure::Transition {
        state: state.to_string(),
        edge: edge.to_string(),
        cause,
    }
}

/// Execute a valid transition from `state` along `edge` into `target`.
///
/// An effect failure is a [`Failure::Transition`]. The expectation is not
/// evaluated here.
pub async fn execute_transition<L: Ledger>(
    spec: &TransitionSpec<L>,
    session: &Session<L>,
    ctx: &Context,
    state: &str,
    edge: &str,
    target: &str,
) -> StepResult<TransitionOutcome> {
    match attempt(spec, session, ctx, state, edge).await? {
        Attempt::Confirmed { receipt, subject } => {
            tracing::debug!(state, edge, tx = %receipt.tx_hash, "confirmed");
            let next = match subject {
                Some((key, resolve)) => {
                    let value = resolve(&receipt).map_err(|e| {
                        transition_failure(state, edge, format!("resolving subject '{key}': {e:#}"))
                    })?;
                    ctx.bind(key, value)
                }
                None => ctx.clone(),
            };
            Ok(TransitionOutcome {
                receipt,
                next: next.enter(target),
            })
        }
        Attempt::Refused(e) => Err(transition_failure(state, edge, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Submission;
    use crate::ledger::EventRecord;
    use crate::scripted::{ScriptedCall, ScriptedLedger};
    use serde_json::json;

    fn session() -> Session<ScriptedLedger> {
        Session::new(ScriptedLedger::new())
    }

    #[tokio::test]
    async fn success_binds_subject_and_enters_target() {
        let spec = TransitionSpec::new(|_, _| async {
            let call = ScriptedCall::emit(vec![
                EventRecord::new("Created").with("_depositContractAddress", "0xd1")
            ]);
            Ok(Submission::new(call).resolve_subject("deposit", |receipt| {
                receipt
                    .field("Created", "_depositContractAddress")
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no Created event"))
            }))
        });
        let ctx = Context::new().bind("lot", json!(1)).enter("start");

        let outcome =
            execute_transition(&spec, &session(), &ctx, "start", "create", "awaitingSignerSetup")
                .await
                .unwrap();
        assert_eq!(outcome.next.get("deposit"), Some(&json!("0xd1")));
        assert_eq!(outcome.next.state(), Some("awaitingSignerSetup"));
        assert_eq!(outcome.next.len(), 2);
        assert_eq!(ctx.len(), 1);
    }

    #[tokio::test]
    async fn reverted_effect_is_a_transition_failure() {
        let spec = TransitionSpec::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::revert("Not awaiting funding")))
        });
        let err = execute_transition(&spec, &session(), &Context::new(), "x", "toY", "Y")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Failure::Transition {
                state: "x".to_string(),
                edge: "toY".to_string(),
                cause: "reverted: Not awaiting funding".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn failing_precondition_skips_the_action() {
        let session = session();
        let ledger = session.ledger();
        let spec = TransitionSpec::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::emit(vec![])))
        })
        .precondition(|_, _| async { Err(anyhow::anyhow!("bond not funded")) });

        let err = execute_transition(&spec, &session, &Context::new(), "a", "b", "b")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "precondition");
        assert_eq!(ledger.nonce(), 0);
    }

    #[tokio::test]
    async fn subject_resolver_error_is_reported_with_its_key() {
        let spec = TransitionSpec::new(|_, _| async {
            Ok(Submission::new(ScriptedCall::emit(vec![]))
                .resolve_subject("deposit", |_| Err(anyhow::anyhow!("missing event"))))
        });
        let err = execute_transition(&spec, &session(), &Context::new(), "start", "create", "next")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resolving subject 'deposit': missing event"));
    }
}
