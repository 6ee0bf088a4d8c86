//! Deposit lifecycle graph over a simulated deposit chain.
//!
//! [`deposit_graph`] declares every state a deposit moves through, the calls
//! that move it and the calls each state must refuse. [`SimChain`] is an
//! in-memory ledger implementing those calls, forkable so that every branch
//! of a traversal starts from its own copy.

pub mod chain;
pub mod config;
pub mod graph;
pub mod roundtrip;
pub mod states;
pub mod system;

pub use chain::{DepositCall, PendingTx, SimChain, SimError};
pub use config::ChainConfig;
pub use graph::{deposit_graph, ROOT};
pub use states::DepositState;
