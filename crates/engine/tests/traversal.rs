//! End-to-end traversal tests against the scripted ledger.
//!
//! Each test builds a small graph, runs the driver over it and inspects the
//! report: path traces, failure kinds, probe outcomes and final contexts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use statewalk_engine::scripted::{ScriptedCall, ScriptedLedger};
use statewalk_engine::{
    Assertion, Context, Driver, DriverConfig, EventRecord, Failure, PathStatus, Session,
    StateGraph, StateNode, Submission, TransitionSpec,
};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

type Spec = TransitionSpec<ScriptedLedger>;

fn succeeds() -> Spec {
    TransitionSpec::new(|_, _| async { Ok(Submission::new(ScriptedCall::emit(vec![]))) })
}

fn reverts(reason: &'static str) -> Spec {
    TransitionSpec::new(move |_, _| async move {
        Ok(Submission::new(ScriptedCall::revert(reason)))
    })
}

/// Succeeds and binds `key` to a value taken from the emitted event.
fn produces(key: &'static str, value: &'static str) -> Spec {
    TransitionSpec::new(move |_, _| async move {
        let call = ScriptedCall::emit(vec![EventRecord::new("Produced").with("subject", value)]);
        Ok(Submission::new(call).resolve_subject(key, |receipt| {
            receipt
                .field("Produced", "subject")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no Produced event"))
        }))
    })
}

fn sum_of(ctx: &Context, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|k| ctx.get(k).and_then(Value::as_i64))
        .sum()
}

async fn run(graph: StateGraph<ScriptedLedger>, root: &str) -> statewalk_engine::RunReport {
    Driver::new(graph, DriverConfig::default())
        .run(root, Session::new(ScriptedLedger::new()))
        .await
        .unwrap()
}

// ──────────────────────────────────────────────
// Scenarios
// ──────────────────────────────────────────────

#[tokio::test]
async fn resolved_dependencies_reach_the_expectation() {
    let to_x = succeeds().expect(|_, input| async move {
        Ok(vec![Assertion::equals("a + b", 3, sum_of(&input.next, &["a", "b"]))])
    });
    let graph = StateGraph::new().with(
        StateNode::new("root")
            .depends_on("a", |_, _| async { Ok(json!(1)) })
            .depends_on("b", |_, _| async { Ok(json!(2)) })
            .transition("toX", "X", to_x),
    );

    let report = run(graph, "root").await;

    assert!(report.passed(), "{report}");
    assert_eq!(report.paths.len(), 1);
    assert_eq!(report.paths[0].trace(), vec!["root", "toX", "X"]);
    assert_eq!(report.paths[0].context.len(), 2);
}

#[tokio::test]
async fn accepted_invalid_transition_is_reported_independently() {
    let graph = StateGraph::new().with(
        StateNode::new("node")
            .to("next", succeeds())
            .reject("early", succeeds()),
    );

    let report = run(graph, "node").await;

    assert!(report.paths[0].passed());
    assert_eq!(report.probes.len(), 1);
    assert_eq!(
        report.probes[0].outcome.failure(),
        Some(&Failure::UnexpectedSuccess {
            state: "node".to_string(),
            label: "early".to_string(),
        })
    );
    assert_eq!(report.failure_count(), 1);
}

#[tokio::test]
async fn confirmation_failure_skips_the_expectation() {
    let checked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&checked);
    let to_y = reverts("guard").expect(move |_, _| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(vec![])
        }
    });
    let graph = StateGraph::new().with(StateNode::new("start").transition("toY", "Y", to_y));

    let report = run(graph, "start").await;

    let path = &report.paths[0];
    assert_eq!(path.trace(), vec!["start", "toY", "Y"]);
    assert!(matches!(
        &path.status,
        PathStatus::Failed { at: 0, failure: Failure::Transition { edge, .. } } if edge == "toY"
    ));
    assert!(path.steps[0].tx_hash.is_none());
    assert!(!checked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn failing_sibling_does_not_touch_the_passing_one() {
    let good = produces("subject", "0xgood")
        .expect(|_, _| async { Ok(vec![Assertion::equals("ok", true, true)]) });
    let bad = produces("subject", "0xbad").expect(|_, input| async move {
        Ok(vec![Assertion::equals(
            "subject",
            "0xexpected",
            input.next.get("subject").cloned().unwrap_or_default(),
        )])
    });
    let graph = StateGraph::new()
        .with(StateNode::new("fork").to("good", good).to("bad", bad))
        .with(StateNode::new("good"))
        .with(StateNode::new("bad"));

    let report = run(graph, "fork").await;

    assert_eq!(report.paths.len(), 2);
    let good = &report.paths[0];
    let bad = &report.paths[1];
    assert!(good.passed());
    assert_eq!(good.context.get("subject"), Some(&json!("0xgood")));
    assert_eq!(good.context.len(), 1);
    assert_eq!(bad.failure().map(Failure::kind), Some("expectation"));
    assert!(bad.steps[0].tx_hash.is_some());
}

#[tokio::test]
async fn context_length_counts_dependencies_and_subjects() {
    let graph = StateGraph::new()
        .with(
            StateNode::new("start")
                .depends_on("lot", |_, _| async { Ok(json!(1)) })
                .depends_on("fee", |_, _| async { Ok(json!(2)) })
                .to("created", produces("deposit", "0xd1")),
        )
        .with(
            StateNode::new("created")
                .depends_on("price", |_, _| async { Ok(json!(3)) })
                .to("funded", succeeds()),
        )
        .with(
            StateNode::new("funded")
                .depends_on("bond", |_, _| async { Ok(json!(4)) })
                .to("closed", produces("deposit", "0xd1")),
        );

    let report = run(graph, "start").await;

    let path = &report.paths[0];
    assert!(path.passed(), "{report}");
    // four dependencies plus two produced subjects
    assert_eq!(path.context.len(), 6);
    assert_eq!(path.context.state(), Some("closed"));
}

#[tokio::test]
async fn dependency_failure_aborts_before_any_transition() {
    let graph = StateGraph::new().with(
        StateNode::new("start")
            .depends_on("price", |_, _| async { Err(anyhow::anyhow!("feed offline")) })
            .to("next", succeeds())
            .reject("early", reverts("guard")),
    );
    let ledger = ScriptedLedger::new();
    let stats = ledger.stats();

    let report = Driver::new(graph, DriverConfig::default())
        .run("start", Session::new(ledger))
        .await
        .unwrap();

    assert_eq!(report.paths.len(), 1);
    assert_eq!(
        report.paths[0].failure(),
        Some(&Failure::DependencyResolution {
            state: "start".to_string(),
            name: "price".to_string(),
            cause: "feed offline".to_string(),
        })
    );
    assert!(report.probes.is_empty());
    assert_eq!(stats.submitted.load(Ordering::SeqCst), 0);
}

// ──────────────────────────────────────────────
// Isolation and concurrency
// ──────────────────────────────────────────────

#[tokio::test]
async fn probes_never_extend_the_valid_subtree_context() {
    let probe = TransitionSpec::new(|_, ctx: Context| async move {
        // a probe sees the node context but cannot hand anything back
        assert!(ctx.get("deposit").is_some());
        Ok(Submission::new(ScriptedCall::revert("guard"))
            .resolve_subject("probe", |_| Ok(json!("leak"))))
    });
    let graph = StateGraph::new()
        .with(
            StateNode::new("start")
                .depends_on("deposit", |_, _| async { Ok(json!("0xd1")) })
                .to("next", succeeds())
                .reject("invalid", probe),
        )
        .with(StateNode::new("next"));

    let report = run(graph, "start").await;

    assert!(report.passed(), "{report}");
    assert!(report.paths[0].context.get("probe").is_none());
    assert_eq!(report.paths[0].context.keys().len(), 1);
}

#[tokio::test]
async fn every_branch_gets_its_own_fork() {
    let graph = StateGraph::new()
        .with(
            StateNode::new("start")
                .to("a", succeeds())
                .to("b", succeeds())
                .reject("early", reverts("guard")),
        )
        .with(StateNode::new("a"))
        .with(StateNode::new("b"));
    let ledger = ScriptedLedger::new().forkable();
    let stats = ledger.stats();

    let report = Driver::new(graph, DriverConfig::default())
        .run("start", Session::new(ledger))
        .await
        .unwrap();

    assert!(report.passed(), "{report}");
    assert_eq!(stats.forks.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn sibling_submissions_are_serialized() {
    let mut node = StateNode::new("start");
    for i in 0..5 {
        node = node.to(format!("leaf{i}"), succeeds());
    }
    let graph = StateGraph::new().with(node);
    let ledger = ScriptedLedger::new().with_submit_delay(Duration::from_millis(20));
    let stats = ledger.stats();
    let config = DriverConfig {
        branch_concurrency: 8,
        isolate_branches: false,
        ..DriverConfig::default()
    };

    let report = Driver::new(graph, config)
        .run("start", Session::new(ledger))
        .await
        .unwrap();

    assert!(report.passed(), "{report}");
    assert_eq!(report.paths.len(), 5);
    assert_eq!(stats.submitted.load(Ordering::SeqCst), 5);
    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_timeout_reports_pending_paths_and_keeps_finished_ones() {
    let stalls = TransitionSpec::new(|_, _| async {
        Ok(Submission::new(ScriptedCall::Stall(Duration::from_secs(30))))
    });
    let graph = StateGraph::new().with(
        StateNode::new("start")
            .to("fast", succeeds())
            .to("slow", stalls),
    );
    let config = DriverConfig {
        run_timeout: Duration::from_millis(200),
        ..DriverConfig::default()
    };

    let report = Driver::new(graph, config)
        .run("start", Session::new(ScriptedLedger::new()))
        .await
        .unwrap();

    assert_eq!(report.paths.len(), 2);
    assert!(report.paths[0].passed());
    assert_eq!(
        report.paths[1].status,
        PathStatus::Failed {
            at: 0,
            failure: Failure::TraversalTimeout {
                state: "start".to_string(),
            },
        }
    );
    assert!(report.elapsed < Duration::from_secs(30));
}
