//! Graph traversal.
//!
//! The driver explores every path of a [`StateGraph`] from a root state. At
//! each node it resolves dependencies, then attempts every probe and follows
//! every valid edge, each on its own branch. Branches of one node are polled
//! concurrently up to [`DriverConfig::branch_concurrency`]; within a branch
//! every step is strictly sequential.
//!
//! Results are written into a journal keyed by each branch's *trail*, the
//! list of declared edge indices leading to it. Iterating the journal in key
//! order yields paths depth-first in declaration order, whatever order they
//! finished in. Branches are registered as pending before they are polled,
//! so when the run deadline expires every unfinished branch can be reported
//! as timed out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::context::Context;
use crate::error::Failure;
use crate::execute::execute_transition;
use crate::graph::{Edge, GraphError, StateGraph, StateNode};
use crate::ledger::{EffectError, Ledger, Session};
use crate::probe::{probe_invalid_transition, ProbeOutcome};
use crate::report::{PathReport, PathStatus, ProbeReport, RunReport, Step};
use crate::resolve::resolve_dependencies;
use crate::verify::verify_expectation;

// ──────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────

/// Traversal limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Wall-clock bound for the whole run.
    pub run_timeout: Duration,
    /// Maximum number of transitions on one path.
    pub max_depth: usize,
    /// Sibling branches (edges and probes) of one node polled at once.
    pub branch_concurrency: usize,
    /// Give every branch its own fork of the ledger when it supports forking.
    pub isolate_branches: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            max_depth: 64,
            branch_concurrency: 4,
            isolate_branches: true,
        }
    }
}

// ──────────────────────────────────────────────
// Journal
// ──────────────────────────────────────────────

type Trail = Vec<usize>;

/// A branch that has been scheduled but has not concluded.
#[derive(Debug, Clone)]
struct Pending {
    state: String,
    steps: Vec<Step>,
    ctx: Context,
}

#[derive(Debug, Default)]
struct JournalState {
    pending: BTreeMap<Trail, Pending>,
    paths: BTreeMap<Trail, PathReport>,
    pending_probes: BTreeMap<(Trail, usize), ProbeReport>,
    probes: BTreeMap<(Trail, usize), ProbeReport>,
}

#[derive(Debug)]
struct Journal {
    root: String,
    state: Mutex<JournalState>,
}

impl Journal {
    fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            state: Mutex::new(JournalState::default()),
        }
    }

    fn trace(&self, steps: &[Step]) -> Vec<String> {
        let mut trace = vec![self.root.clone()];
        for step in steps {
            trace.push(step.edge.clone());
            trace.push(step.target.clone());
        }
        trace
    }

    fn track(&self, trail: &[usize], pending: Pending) {
        self.state.lock().pending.insert(trail.to_vec(), pending);
    }

    /// Replace the pending entry of `parent` by its children.
    fn branch(&self, parent: &[usize], children: Vec<(Trail, Pending)>) {
        let mut state = self.state.lock();
        state.pending.remove(parent);
        state.pending.extend(children);
    }

    fn conclude(&self, trail: &[usize], steps: Vec<Step>, status: PathStatus, ctx: Context) {
        let report = PathReport {
            root: self.root.clone(),
            steps,
            status,
            context: ctx,
        };
        match &report.status {
            PathStatus::Completed { terminal, revisited } => {
                tracing::info!(
                    path = %report.trace().join(" -> "),
                    %terminal,
                    revisited,
                    "path completed"
                )
            }
            PathStatus::Failed { failure, .. } => {
                tracing::warn!(path = %report.trace().join(" -> "), %failure, "path failed")
            }
        }
        let mut state = self.state.lock();
        state.pending.remove(trail);
        state.paths.insert(trail.to_vec(), report);
    }

    fn track_probe(&self, key: (Trail, usize), report: ProbeReport) {
        self.state.lock().pending_probes.insert(key, report);
    }

    fn record_probe(&self, key: (Trail, usize), outcome: ProbeOutcome) {
        let mut state = self.state.lock();
        if let Some(mut report) = state.pending_probes.remove(&key) {
            report.outcome = outcome;
            state.probes.insert(key, report);
        }
    }

    /// Conclude every unfinished branch as timed out.
    fn expire(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for (trail, p) in pending {
            let at = p
                .steps
                .iter()
                .position(|s| s.tx_hash.is_none())
                .unwrap_or(p.steps.len());
            let failure = Failure::TraversalTimeout { state: p.state };
            state.paths.insert(
                trail,
                PathReport {
                    root: self.root.clone(),
                    steps: p.steps,
                    status: PathStatus::Failed { at, failure },
                    context: p.ctx,
                },
            );
        }
        let probes = std::mem::take(&mut state.pending_probes);
        for (key, mut report) in probes {
            report.outcome = ProbeOutcome::Failed {
                failure: Failure::TraversalTimeout {
                    state: report.state.clone(),
                },
            };
            state.probes.insert(key, report);
        }
    }

    fn into_reports(self) -> (Vec<PathReport>, Vec<ProbeReport>) {
        let state = self.state.into_inner();
        (
            state.paths.into_values().collect(),
            state.probes.into_values().collect(),
        )
    }
}

// ──────────────────────────────────────────────
// Driver
// ──────────────────────────────────────────────

/// Where a branch stands: the state it is in and how it got there.
struct Visit {
    state: String,
    ctx: Context,
    steps: Vec<Step>,
    trail: Trail,
    /// States already visited on this path, root included.
    on_path: Vec<String>,
}

type Branch<L> = Result<Session<L>, EffectError>;

/// Explores a [`StateGraph`] against a ledger session.
pub struct Driver<L: Ledger> {
    graph: Arc<StateGraph<L>>,
    config: DriverConfig,
}

impl<L: Ledger> Driver<L> {
    pub fn new(graph: StateGraph<L>, config: DriverConfig) -> Self {
        Self::from_shared(Arc::new(graph), config)
    }

    pub fn from_shared(graph: Arc<StateGraph<L>>, config: DriverConfig) -> Self {
        Self { graph, config }
    }

    pub fn graph(&self) -> &StateGraph<L> {
        &self.graph
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Explore every path from `root`.
    ///
    /// Only structural graph errors fail the call. Everything that goes wrong
    /// during the traversal is recorded in the returned report.
    pub async fn run(&self, root: &str, session: Session<L>) -> Result<RunReport, GraphError> {
        let warnings = self.graph.validate(root)?;
        for warning in &warnings {
            tracing::warn!(%warning, "graph warning");
        }

        let started = Instant::now();
        let journal = Journal::new(root);
        let start = Visit {
            state: root.to_string(),
            ctx: Context::new().enter(root),
            steps: Vec::new(),
            trail: Vec::new(),
            on_path: vec![root.to_string()],
        };
        journal.track(
            &start.trail,
            Pending {
                state: start.state.clone(),
                steps: Vec::new(),
                ctx: start.ctx.clone(),
            },
        );

        tracing::info!(root, timeout = ?self.config.run_timeout, "starting traversal");
        let traversal = self.visit(session, start, &journal);
        if tokio::time::timeout(self.config.run_timeout, traversal)
            .await
            .is_err()
        {
            tracing::warn!(timeout = ?self.config.run_timeout, "run deadline expired");
            journal.expire();
        }

        let (paths, probes) = journal.into_reports();
        let report = RunReport {
            root: root.to_string(),
            paths,
            probes,
            warnings,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            summary = %report.summary(),
            elapsed = ?report.elapsed,
            "traversal finished"
        );
        Ok(report)
    }

    async fn branch_session(&self, session: &Session<L>) -> Branch<L> {
        if self.config.isolate_branches {
            session.fork().await
        } else {
            Ok(session.clone())
        }
    }

    fn visit<'a>(
        &'a self,
        session: Session<L>,
        at: Visit,
        journal: &'a Journal,
    ) -> BoxFuture<'a, ()> {
        async move {
            let Visit {
                state,
                ctx,
                steps,
                trail,
                on_path,
            } = at;

            let Some(node) = self.graph.node(&state) else {
                tracing::debug!(state = %state, "undeclared state, treating as terminal");
                let status = PathStatus::Completed {
                    terminal: state,
                    revisited: false,
                };
                journal.conclude(&trail, steps, status, ctx);
                return;
            };

            let ctx = match resolve_dependencies(node, session.ledger(), &ctx).await {
                Ok(resolved) => resolved,
                Err(failure) => {
                    let at = steps.len();
                    journal.conclude(&trail, steps, PathStatus::Failed { at, failure }, ctx);
                    return;
                }
            };

            let descend = if node.is_terminal() {
                let status = PathStatus::Completed {
                    terminal: state.clone(),
                    revisited: false,
                };
                journal.conclude(&trail, steps.clone(), status, ctx.clone());
                false
            } else if steps.len() >= self.config.max_depth {
                let failure = Failure::DepthExceeded {
                    state: state.clone(),
                    max_depth: self.config.max_depth,
                };
                let at = steps.len();
                let status = PathStatus::Failed { at, failure };
                journal.conclude(&trail, steps.clone(), status, ctx.clone());
                false
            } else {
                journal.track(
                    &trail,
                    Pending {
                        state: state.clone(),
                        steps: steps.clone(),
                        ctx: ctx.clone(),
                    },
                );
                true
            };

            // Every branch session is taken before any branch is polled, so
            // forks all start from the state this node was reached in.
            let mut shared = false;
            let mut probe_tasks = Vec::new();
            let path = journal.trace(&steps);
            for (j, probe) in node.probes().iter().enumerate() {
                let branch = self.branch_session(&session).await;
                shared |= matches!(&branch, Ok(s) if s.shares_ledger_with(&session));
                let key = (trail.clone(), j);
                journal.track_probe(
                    key.clone(),
                    ProbeReport {
                        state: state.clone(),
                        label: probe.label.clone(),
                        path: path.clone(),
                        outcome: ProbeOutcome::Rejected {
                            cause: String::new(),
                        },
                    },
                );
                let ctx = ctx.clone();
                let name: &str = &state;
                probe_tasks.push(
                    async move {
                        let outcome = match branch {
                            Ok(session) => {
                                probe_invalid_transition(probe, &session, &ctx, name).await
                            }
                            Err(e) => ProbeOutcome::Failed {
                                failure: Failure::Transition {
                                    state: name.to_string(),
                                    edge: probe.label.clone(),
                                    cause: format!("forking ledger: {e}"),
                                },
                            },
                        };
                        journal.record_probe(key, outcome);
                    }
                    .boxed(),
                );
            }

            let mut edge_tasks = Vec::new();
            if descend {
                let mut children = Vec::new();
                for (i, edge) in node.edges().iter().enumerate() {
                    let branch = self.branch_session(&session).await;
                    shared |= matches!(&branch, Ok(s) if s.shares_ledger_with(&session));
                    let mut child_trail = trail.clone();
                    child_trail.push(i);
                    let mut attempted = steps.clone();
                    attempted.push(Step {
                        state: state.clone(),
                        edge: edge.label.clone(),
                        target: edge.target.clone(),
                        tx_hash: None,
                    });
                    children.push((
                        child_trail.clone(),
                        Pending {
                            state: state.clone(),
                            steps: attempted,
                            ctx: ctx.clone(),
                        },
                    ));
                    let from = Visit {
                        state: state.clone(),
                        ctx: ctx.clone(),
                        steps: steps.clone(),
                        trail: child_trail,
                        on_path: on_path.clone(),
                    };
                    edge_tasks.push(self.follow(branch, node, edge, from, journal));
                }
                journal.branch(&trail, children);
            }

            let limit = self.config.branch_concurrency.max(1);
            if shared {
                // Probes on a shared ledger must see the node's state, not
                // whatever a sibling edge left behind.
                stream::iter(probe_tasks)
                    .for_each_concurrent(limit, |task| task)
                    .await;
                stream::iter(edge_tasks)
                    .for_each_concurrent(limit, |task| task)
                    .await;
            } else {
                stream::iter(probe_tasks.into_iter().chain(edge_tasks))
                    .for_each_concurrent(limit, |task| task)
                    .await;
            }
        }
        .boxed()
    }

    fn follow<'a>(
        &'a self,
        branch: Branch<L>,
        node: &'a StateNode<L>,
        edge: &'a Edge<L>,
        from: Visit,
        journal: &'a Journal,
    ) -> BoxFuture<'a, ()> {
        async move {
            let Visit {
                state,
                ctx,
                mut steps,
                trail,
                mut on_path,
            } = from;
            let at = steps.len();
            steps.push(Step {
                state: state.clone(),
                edge: edge.label.clone(),
                target: edge.target.clone(),
                tx_hash: None,
            });

            let session = match branch {
                Ok(session) => session,
                Err(e) => {
                    let failure = Failure::Transition {
                        state: node.name().to_string(),
                        edge: edge.label.clone(),
                        cause: format!("forking ledger: {e}"),
                    };
                    journal.conclude(&trail, steps, PathStatus::Failed { at, failure }, ctx);
                    return;
                }
            };

            let outcome = match execute_transition(
                &edge.spec,
                &session,
                &ctx,
                &state,
                &edge.label,
                &edge.target,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(failure) => {
                    journal.conclude(&trail, steps, PathStatus::Failed { at, failure }, ctx);
                    return;
                }
            };
            steps[at].tx_hash = Some(outcome.receipt.tx_hash.clone());

            if let Err(failure) = verify_expectation(
                &edge.spec,
                session.ledger(),
                &state,
                &edge.label,
                &ctx,
                &outcome.receipt,
                &outcome.next,
            )
            .await
            {
                journal.conclude(&trail, steps, PathStatus::Failed { at, failure }, outcome.next);
                return;
            }

            if on_path.contains(&edge.target) {
                let status = PathStatus::Completed {
                    terminal: edge.target.clone(),
                    revisited: true,
                };
                journal.conclude(&trail, steps, status, outcome.next);
                return;
            }

            journal.track(
                &trail,
                Pending {
                    state: edge.target.clone(),
                    steps: steps.clone(),
                    ctx: outcome.next.clone(),
                },
            );
            on_path.push(edge.target.clone());
            let next = Visit {
                state: edge.target.clone(),
                ctx: outcome.next,
                steps,
                trail,
                on_path,
            };
            self.visit(session, next, journal).await;
        }
        .boxed()
    }
}

impl<L: Ledger> std::fmt::Debug for Driver<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("graph", &self.graph)
            .field("config", &self.config)
            .finish()
    }
}
