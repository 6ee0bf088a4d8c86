//! Declarative state-graph traversal engine.
//!
//! A [`StateGraph`] describes the lifecycle of an external state machine:
//! each state declares the values it needs, the transitions that must
//! succeed from it and the ones that must be refused. The [`Driver`] walks
//! every path of the graph against a [`Ledger`], verifying expectations
//! after each transition and probing every refused transition, and reports
//! the outcome of each path in a [`RunReport`].

pub mod context;
pub mod driver;
pub mod error;
pub mod execute;
pub mod graph;
pub mod ledger;
pub mod probe;
pub mod report;
pub mod resolve;
pub mod scripted;
pub mod verify;

pub use context::{Binding, Context, ContextError};
pub use driver::{Driver, DriverConfig};
pub use error::{Failure, StepResult};
pub use execute::{execute_transition, TransitionOutcome};
pub use graph::{
    Edge, ExpectationInput, GraphError, GraphWarning, Probe, StateGraph, StateNode, Submission,
    TransitionSpec,
};
pub use ledger::{EffectError, EventRecord, Ledger, Receipt, Session};
pub use probe::{probe_invalid_transition, ProbeOutcome};
pub use report::{PathReport, PathStatus, ProbeReport, RunReport, Step};
pub use resolve::resolve_dependencies;
pub use verify::{verify_assertions, verify_expectation, Assertion, Mismatch};
