//! Post-condition checks for valid transitions.
//!
//! An expectation callback returns a list of [`Assertion`]s. The verifier
//! evaluates every one of them against the receipt, so a single report shows
//! all mismatches of a transition instead of stopping at the first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::context::Context;
use crate::error::Failure;
use crate::graph::{ExpectationInput, TransitionSpec};
use crate::ledger::{Ledger, Receipt};

/// A single post-condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// An observed value must equal the expected one.
    Equals {
        label: String,
        expected: Value,
        actual: Value,
    },
    /// The receipt must contain an event with this name whose fields include
    /// every listed `field = value` pair.
    EventEmitted {
        event: String,
        fields: BTreeMap<String, Value>,
    },
}

impl Assertion {
    pub fn equals(
        label: impl Into<String>,
        expected: impl Into<Value>,
        actual: impl Into<Value>,
    ) -> Self {
        Assertion::Equals {
            label: label.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// An event with this name was emitted, fields unchecked.
    pub fn emitted(event: impl Into<String>) -> Self {
        Assertion::EventEmitted {
            event: event.into(),
            fields: BTreeMap::new(),
        }
    }

    /// An event with this name was emitted carrying the given fields.
    pub fn emitted_with<I, K, V>(event: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Assertion::EventEmitted {
            event: event.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Human-readable name used in mismatch reports.
    pub fn label(&self) -> String {
        match self {
            Assertion::Equals { label, .. } => label.clone(),
            Assertion::EventEmitted { event, .. } => format!("event {}", event),
        }
    }

    /// Evaluate against a receipt. `None` means the assertion holds.
    pub fn check(&self, receipt: &Receipt) -> Option<Mismatch> {
        match self {
            Assertion::Equals {
                label,
                expected,
                actual,
            } => (expected != actual).then(|| Mismatch {
                assertion: label.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            Assertion::EventEmitted { event, fields } => {
                let candidates: Vec<&BTreeMap<String, Value>> =
                    receipt.events_named(event).map(|e| &e.fields).collect();
                let matched = candidates
                    .iter()
                    .any(|observed| fields.iter().all(|(k, v)| observed.get(k) == Some(v)));
                if matched {
                    return None;
                }
                let actual = if candidates.is_empty() {
                    Value::Null
                } else {
                    json!(candidates)
                };
                Some(Mismatch {
                    assertion: self.label(),
                    expected: json!(fields),
                    actual,
                })
            }
        }
    }
}

/// A failed assertion with what was expected and what was observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub assertion: String,
    pub expected: Value,
    pub actual: Value,
}

/// Evaluate every assertion, returning all mismatches in declaration order.
pub fn verify_assertions(assertions: &[Assertion], receipt: &Receipt) -> Vec<Mismatch> {
    assertions.iter().filter_map(|a| a.check(receipt)).collect()
}

/// Run a transition's expectation callback and verify what it asserts.
///
/// Returns the number of assertions that held. A transition without an
/// expectation trivially passes.
pub async fn verify_expectation<L: Ledger>(
    spec: &TransitionSpec<L>,
    ledger: Arc<L>,
    state: &str,
    edge: &str,
    previous: &Context,
    receipt: &Receipt,
    next: &Context,
) -> Result<usize, Failure> {
    let Some(expectation) = spec.expectation() else {
        tracing::debug!(state, edge, "no expectation declared");
        return Ok(0);
    };

    let input = ExpectationInput {
        previous: previous.clone(),
        receipt: receipt.clone(),
        next: next.clone(),
    };
    let assertions = expectation(ledger, input).await.map_err(|e| Failure::Expectation {
        state: state.to_string(),
        edge: edge.to_string(),
        mismatches: vec![Mismatch {
            assertion: "expectation evaluation".to_string(),
            expected: Value::Null,
            actual: Value::String(format!("{e:#}")),
        }],
    })?;

    let mismatches = verify_assertions(&assertions, receipt);
    if mismatches.is_empty() {
        tracing::debug!(state, edge, checked = assertions.len(), "expectation held");
        Ok(assertions.len())
    } else {
        for m in &mismatches {
            tracing::warn!(
                state,
                edge,
                assertion = %m.assertion,
                expected = %m.expected,
                actual = %m.actual,
                "assertion failed"
            );
        }
        Err(Failure::Expectation {
            state: state.to_string(),
            edge: edge.to_string(),
            mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EventRecord;

    fn receipt() -> Receipt {
        Receipt {
            tx_hash: "0x01".to_string(),
            block: 1,
            events: vec![
                EventRecord::new("DepositCloneCreated").with("depositCloneAddress", "0xd1"),
                EventRecord::new("Created")
                    .with("_depositContractAddress", "0xd1")
                    .with("_keepAddress", "0xk1"),
            ],
        }
    }

    #[test]
    fn equals_holds_on_identical_values() {
        assert!(Assertion::equals("state", 4, 4).check(&receipt()).is_none());
    }

    #[test]
    fn equals_reports_both_sides() {
        let m = Assertion::equals("state", 4, 8).check(&receipt()).unwrap();
        assert_eq!(m.assertion, "state");
        assert_eq!(m.expected, json!(4));
        assert_eq!(m.actual, json!(8));
    }

    #[test]
    fn event_with_subset_of_fields_matches() {
        let a = Assertion::emitted_with("Created", [("_keepAddress", "0xk1")]);
        assert!(a.check(&receipt()).is_none());
        assert!(Assertion::emitted("DepositCloneCreated")
            .check(&receipt())
            .is_none());
    }

    #[test]
    fn missing_event_reports_null_actual() {
        let m = Assertion::emitted("Funded").check(&receipt()).unwrap();
        assert_eq!(m.assertion, "event Funded");
        assert_eq!(m.actual, Value::Null);
    }

    #[test]
    fn wrong_field_value_reports_observed_events() {
        let m = Assertion::emitted_with("Created", [("_keepAddress", "0xk2")])
            .check(&receipt())
            .unwrap();
        assert_eq!(m.expected, json!({"_keepAddress": "0xk2"}));
        assert_eq!(m.actual[0]["_keepAddress"], json!("0xk1"));
    }

    #[test]
    fn every_assertion_is_evaluated() {
        let assertions = vec![
            Assertion::equals("first", 1, 2),
            Assertion::emitted("DepositCloneCreated"),
            Assertion::emitted("Funded"),
        ];
        let mismatches = verify_assertions(&assertions, &receipt());
        let labels: Vec<&str> = mismatches.iter().map(|m| m.assertion.as_str()).collect();
        assert_eq!(labels, vec!["first", "event Funded"]);
    }
}
