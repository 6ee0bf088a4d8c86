//! Declarative state graph.
//!
//! A [`StateGraph`] maps state names to [`StateNode`]s. Each node declares
//! named asynchronous dependencies, valid outgoing edges, and invalid
//! transitions that the external system is expected to reject. The graph is
//! built once and shared read-only by every path of a run.
//!
//! Callbacks receive owned handles (`Arc<L>`, a [`Context`] clone) so the
//! futures they return do not borrow from the graph. Plain `async fn`s with
//! the right signature can be passed directly:
//!
//! ```ignore
//! async fn lot_size(chain: Arc<SimChain>, _ctx: Context) -> anyhow::Result<Value> {
//!     Ok(json!(chain.lot_sizes()[0]))
//! }
//!
//! let start = StateNode::new("start").depends_on("lotSize", lot_size);
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::ledger::{Ledger, Receipt};
use crate::verify::Assertion;

// ──────────────────────────────────────────────
// Callback types
// ──────────────────────────────────────────────

/// Resolves one named dependency from the current context.
pub type Dependency<L> =
    Arc<dyn Fn(Arc<L>, Context) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Setup action run before an edge's action.
pub type Hook<L> =
    Arc<dyn Fn(Arc<L>, Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Produces the operation to submit for an edge.
pub type Action<L> = Arc<
    dyn Fn(
            Arc<L>,
            Context,
        ) -> BoxFuture<'static, anyhow::Result<Submission<<L as Ledger>::Operation>>>
        + Send
        + Sync,
>;

/// Produces the assertions that must hold after a valid edge.
pub type Expectation<L> = Arc<
    dyn Fn(Arc<L>, ExpectationInput) -> BoxFuture<'static, anyhow::Result<Vec<Assertion>>>
        + Send
        + Sync,
>;

/// Maps a confirmed receipt to the subject bound in the successor context.
pub type SubjectResolver = Box<dyn FnOnce(&Receipt) -> anyhow::Result<Value> + Send>;

/// Everything an expectation can look at.
#[derive(Debug, Clone)]
pub struct ExpectationInput {
    /// Context the transition started from.
    pub previous: Context,
    pub receipt: Receipt,
    /// Context handed to the successor state.
    pub next: Context,
}

// ──────────────────────────────────────────────
// Submission
// ──────────────────────────────────────────────

/// The operation an action wants submitted, plus an optional resolver that
/// turns the receipt into the next context's subject.
pub struct Submission<Op> {
    operation: Op,
    subject: Option<(String, SubjectResolver)>,
}

impl<Op> Submission<Op> {
    pub fn new(operation: Op) -> Self {
        Self {
            operation,
            subject: None,
        }
    }

    /// Bind the value produced by `resolver` under `key` once the effect is
    /// confirmed.
    pub fn resolve_subject<F>(mut self, key: impl Into<String>, resolver: F) -> Self
    where
        F: FnOnce(&Receipt) -> anyhow::Result<Value> + Send + 'static,
    {
        self.subject = Some((key.into(), Box::new(resolver)));
        self
    }

    pub fn operation(&self) -> &Op {
        &self.operation
    }

    pub(crate) fn into_parts(self) -> (Op, Option<(String, SubjectResolver)>) {
        (self.operation, self.subject)
    }
}

impl<Op: fmt::Debug> fmt::Debug for Submission<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("operation", &self.operation)
            .field("subject", &self.subject.as_ref().map(|(key, _)| key))
            .finish()
    }
}

// ──────────────────────────────────────────────
// TransitionSpec
// ──────────────────────────────────────────────

/// An edge's behaviour: optional precondition, action, optional expectation.
pub struct TransitionSpec<L: Ledger> {
    precondition: Option<Hook<L>>,
    action: Action<L>,
    expectation: Option<Expectation<L>>,
}

impl<L: Ledger> Clone for TransitionSpec<L> {
    fn clone(&self) -> Self {
        Self {
            precondition: self.precondition.clone(),
            action: Arc::clone(&self.action),
            expectation: self.expectation.clone(),
        }
    }
}

impl<L: Ledger> TransitionSpec<L> {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(Arc<L>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Submission<L::Operation>>> + Send + 'static,
    {
        Self {
            precondition: None,
            action: Arc::new(move |ledger, ctx| action(ledger, ctx).boxed()),
            expectation: None,
        }
    }

    /// Run `hook` before the action. A failing hook aborts the path.
    pub fn precondition<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<L>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.precondition = Some(Arc::new(move |ledger, ctx| hook(ledger, ctx).boxed()));
        self
    }

    /// Post-conditions checked after the effect is confirmed.
    pub fn expect<F, Fut>(mut self, expectation: F) -> Self
    where
        F: Fn(Arc<L>, ExpectationInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Assertion>>> + Send + 'static,
    {
        self.expectation = Some(Arc::new(move |ledger, input| {
            expectation(ledger, input).boxed()
        }));
        self
    }

    pub fn precondition_hook(&self) -> Option<&Hook<L>> {
        self.precondition.as_ref()
    }

    pub fn action(&self) -> &Action<L> {
        &self.action
    }

    pub fn expectation(&self) -> Option<&Expectation<L>> {
        self.expectation.as_ref()
    }
}

impl<L: Ledger> fmt::Debug for TransitionSpec<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionSpec")
            .field("precondition", &self.precondition.is_some())
            .field("expectation", &self.expectation.is_some())
            .finish_non_exhaustive()
    }
}

// ──────────────────────────────────────────────
// StateNode
// ──────────────────────────────────────────────

/// A valid outgoing edge.
pub struct Edge<L: Ledger> {
    /// Unique within the source node.
    pub label: String,
    /// Declared successor state. Authoritative for traversal.
    pub target: String,
    pub spec: TransitionSpec<L>,
}

/// An invalid transition attempted from a node and expected to be rejected.
pub struct Probe<L: Ledger> {
    pub label: String,
    pub spec: TransitionSpec<L>,
}

impl<L: Ledger> fmt::Debug for Edge<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("label", &self.label)
            .field("target", &self.target)
            .field("spec", &self.spec)
            .finish()
    }
}

impl<L: Ledger> fmt::Debug for Probe<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("label", &self.label)
            .field("spec", &self.spec)
            .finish()
    }
}

/// A vertex of the graph: one lifecycle state of the system under test.
pub struct StateNode<L: Ledger> {
    name: String,
    dependencies: Vec<(String, Dependency<L>)>,
    edges: Vec<Edge<L>>,
    probes: Vec<Probe<L>>,
}

impl<L: Ledger> StateNode<L> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            edges: Vec::new(),
            probes: Vec::new(),
        }
    }

    /// Declare a dependency resolved before any transition from this node.
    pub fn depends_on<F, Fut>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(Arc<L>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let resolver: Dependency<L> = Arc::new(move |ledger, ctx| resolver(ledger, ctx).boxed());
        self.dependencies.push((name.into(), resolver));
        self
    }

    /// Declare a valid edge to `target`, labelled with the target's name.
    pub fn to(self, target: impl Into<String>, spec: TransitionSpec<L>) -> Self {
        let target = target.into();
        self.transition(target.clone(), target, spec)
    }

    /// Declare a valid edge with an explicit label.
    pub fn transition(
        mut self,
        label: impl Into<String>,
        target: impl Into<String>,
        spec: TransitionSpec<L>,
    ) -> Self {
        self.edges.push(Edge {
            label: label.into(),
            target: target.into(),
            spec,
        });
        self
    }

    /// Declare an invalid transition that must be rejected.
    pub fn reject(mut self, label: impl Into<String>, spec: TransitionSpec<L>) -> Self {
        self.probes.push(Probe {
            label: label.into(),
            spec,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[(String, Dependency<L>)] {
        &self.dependencies
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|(name, _)| name.as_str())
    }

    pub fn edges(&self) -> &[Edge<L>] {
        &self.edges
    }

    pub fn probes(&self) -> &[Probe<L>] {
        &self.probes
    }

    /// A node without valid edges ends every path that reaches it.
    pub fn is_terminal(&self) -> bool {
        self.edges.is_empty()
    }
}

impl<L: Ledger> fmt::Debug for StateNode<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("name", &self.name)
            .field("dependencies", &self.dependency_names().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("probes", &self.probes)
            .finish()
    }
}

// ──────────────────────────────────────────────
// Validation
// ──────────────────────────────────────────────

/// Structural errors that prevent a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("root state '{0}' is not declared")]
    UnknownRoot(String),

    #[error("state '{0}' is declared more than once")]
    DuplicateState(String),

    #[error("state '{state}' declares edge '{label}' more than once")]
    DuplicateEdge { state: String, label: String },

    #[error("state '{state}' declares dependency '{name}' more than once")]
    DuplicateDependency { state: String, name: String },

    #[error("state '{state}' declares invalid transition '{label}' more than once")]
    DuplicateProbe { state: String, label: String },
}

/// Suspicious but runnable graph shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphWarning {
    /// An edge returns to its own source. The edge is kept as declared; it
    /// concludes the path as a revisit.
    SelfTransition { state: String, label: String },

    /// An edge targets a state with no declaration; it is explored as terminal.
    UndeclaredTarget {
        state: String,
        label: String,
        target: String,
    },

    /// A declared state cannot be reached from the root.
    Unreachable { state: String },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphWarning::SelfTransition { state, label } => {
                write!(f, "edge '{}' of state '{}' targets its own source", label, state)
            }
            GraphWarning::UndeclaredTarget {
                state,
                label,
                target,
            } => write!(
                f,
                "edge '{}' of state '{}' targets undeclared state '{}' (treated as terminal)",
                label, state, target
            ),
            GraphWarning::Unreachable { state } => {
                write!(f, "state '{}' is unreachable from the root", state)
            }
        }
    }
}

// ──────────────────────────────────────────────
// StateGraph
// ──────────────────────────────────────────────

/// The full declarative graph.
pub struct StateGraph<L: Ledger> {
    nodes: Vec<StateNode<L>>,
}

impl<L: Ledger> Default for StateGraph<L> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<L: Ledger> StateGraph<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Duplicate names are reported by [`StateGraph::validate`].
    pub fn with(mut self, node: StateNode<L>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, name: &str) -> Option<&StateNode<L>> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[StateNode<L>] {
        &self.nodes
    }

    /// Check the graph before a run starting at `root`.
    pub fn validate(&self, root: &str) -> Result<Vec<GraphWarning>, GraphError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateState(node.name.clone()));
            }
            check_unique(node.dependency_names(), |name| {
                GraphError::DuplicateDependency {
                    state: node.name.clone(),
                    name,
                }
            })?;
            check_unique(node.edges.iter().map(|e| e.label.as_str()), |label| {
                GraphError::DuplicateEdge {
                    state: node.name.clone(),
                    label,
                }
            })?;
            check_unique(node.probes.iter().map(|p| p.label.as_str()), |label| {
                GraphError::DuplicateProbe {
                    state: node.name.clone(),
                    label,
                }
            })?;
        }
        if self.node(root).is_none() {
            return Err(GraphError::UnknownRoot(root.to_string()));
        }

        let mut warnings = Vec::new();
        for node in &self.nodes {
            for edge in &node.edges {
                if edge.target == node.name {
                    warnings.push(GraphWarning::SelfTransition {
                        state: node.name.clone(),
                        label: edge.label.clone(),
                    });
                }
                if self.node(&edge.target).is_none() {
                    warnings.push(GraphWarning::UndeclaredTarget {
                        state: node.name.clone(),
                        label: edge.label.clone(),
                        target: edge.target.clone(),
                    });
                }
            }
        }

        let reachable = self.reachable_from(root);
        for node in &self.nodes {
            if !reachable.contains(node.name.as_str()) {
                warnings.push(GraphWarning::Unreachable {
                    state: node.name.clone(),
                });
            }
        }
        Ok(warnings)
    }

    /// Names of every state reachable from `root`, undeclared targets included.
    pub fn reachable_from<'a>(&'a self, root: &'a str) -> BTreeSet<&'a str> {
        let mut reached = BTreeSet::new();
        let mut frontier = vec![root];
        while let Some(name) = frontier.pop() {
            if !reached.insert(name) {
                continue;
            }
            if let Some(node) = self.node(name) {
                frontier.extend(node.edges.iter().map(|e| e.target.as_str()));
            }
        }
        reached
    }
}

impl<L: Ledger> fmt::Debug for StateGraph<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.nodes).finish()
    }
}

fn check_unique<'a>(
    names: impl Iterator<Item = &'a str>,
    err: impl Fn(String) -> GraphError,
) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(err(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedCall, ScriptedLedger};
    use serde_json::json;

    fn noop() -> TransitionSpec<ScriptedLedger> {
        TransitionSpec::new(|_, _| async { Ok(Submission::new(ScriptedCall::emit(vec![]))) })
    }

    #[test]
    fn validate_rejects_unknown_root() {
        let graph = StateGraph::new().with(StateNode::<ScriptedLedger>::new("start"));
        assert_eq!(
            graph.validate("nowhere"),
            Err(GraphError::UnknownRoot("nowhere".to_string()))
        );
    }

    #[test]
    fn validate_rejects_duplicate_labels() {
        let graph = StateGraph::new().with(
            StateNode::new("start")
                .to("active", noop())
                .to("active", noop()),
        );
        assert_eq!(
            graph.validate("start"),
            Err(GraphError::DuplicateEdge {
                state: "start".to_string(),
                label: "active".to_string(),
            })
        );

        let graph = StateGraph::new().with(
            StateNode::<ScriptedLedger>::new("start")
                .depends_on("a", |_, _| async { Ok(json!(1)) })
                .depends_on("a", |_, _| async { Ok(json!(2)) }),
        );
        assert!(matches!(
            graph.validate("start"),
            Err(GraphError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_states() {
        let graph = StateGraph::new()
            .with(StateNode::<ScriptedLedger>::new("start"))
            .with(StateNode::new("start"));
        assert_eq!(
            graph.validate("start"),
            Err(GraphError::DuplicateState("start".to_string()))
        );
    }

    #[test]
    fn validate_flags_self_transitions_undeclared_targets_and_orphans() {
        let graph = StateGraph::new()
            .with(
                StateNode::new("active")
                    .transition("awaitingWithdrawalSignature", "active", noop())
                    .to("courtesyCall", noop()),
            )
            .with(StateNode::new("orphan"));

        let warnings = graph.validate("active").unwrap();
        assert_eq!(
            warnings,
            vec![
                GraphWarning::SelfTransition {
                    state: "active".to_string(),
                    label: "awaitingWithdrawalSignature".to_string(),
                },
                GraphWarning::UndeclaredTarget {
                    state: "active".to_string(),
                    label: "courtesyCall".to_string(),
                    target: "courtesyCall".to_string(),
                },
                GraphWarning::Unreachable {
                    state: "orphan".to_string(),
                },
            ]
        );
    }

    #[test]
    fn lone_self_loop_is_flagged() {
        let graph = StateGraph::new().with(StateNode::new("spin").to("spin", noop()));
        assert_eq!(
            graph.validate("spin").unwrap(),
            vec![GraphWarning::SelfTransition {
                state: "spin".to_string(),
                label: "spin".to_string(),
            }]
        );
    }

    #[test]
    fn to_uses_target_as_label() {
        let node = StateNode::<ScriptedLedger>::new("start").to("active", noop());
        assert_eq!(node.edges()[0].label, "active");
        assert_eq!(node.edges()[0].target, "active");
        assert!(!node.is_terminal());
    }

    #[test]
    fn reachability_follows_edges_across_cycles() {
        let graph = StateGraph::new()
            .with(StateNode::new("a").to("b", noop()))
            .with(StateNode::new("b").to("a", noop()).to("c", noop()));
        let reached: Vec<&str> = graph.reachable_from("a").into_iter().collect();
        assert_eq!(reached, vec!["a", "b", "c"]);
    }
}
