//! The effect submission boundary.
//!
//! The engine never speaks to the system under test directly. It hands
//! opaque operations to a [`Ledger`], which submits them and later confirms
//! them into a [`Receipt`] or an [`EffectError`]. All the engine needs from a
//! receipt is a list of event-like records that expectations can inspect.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

// ──────────────────────────────────────────────
// Receipts
// ──────────────────────────────────────────────

/// An event emitted by a confirmed operation: a name plus a field mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl EventRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Proof that a submitted operation was confirmed by the external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block: u64,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

impl Receipt {
    /// All events named `name`, in emission order.
    pub fn events_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EventRecord> {
        self.events.iter().filter(move |e| e.name == name)
    }

    /// The first event named `name`.
    pub fn event(&self, name: &str) -> Option<&EventRecord> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Field `field` of the first event named `event`.
    pub fn field(&self, event: &str, field: &str) -> Option<&Value> {
        self.event(event).and_then(|e| e.fields.get(field))
    }
}

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Failure of an effect at the submission boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EffectError {
    /// The external system refused the operation before accepting it.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// The operation was accepted but failed during confirmation.
    #[error("reverted: {reason}")]
    Reverted { reason: String },

    /// The external system could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl EffectError {
    /// The system could not be reached, so nothing was decided about the
    /// operation.
    pub fn is_outage(&self) -> bool {
        matches!(self, EffectError::Unavailable(_))
    }
}

// ──────────────────────────────────────────────
// Ledger trait
// ──────────────────────────────────────────────

/// An external system that accepts operations and confirms them asynchronously.
///
/// `submit` should return as soon as the operation is accepted (sequence
/// number assigned, transaction broadcast). `confirm` waits for the outcome.
/// The engine serializes `submit` calls per [`Session`], so implementations
/// can assume one in-flight submission per session.
#[async_trait]
pub trait Ledger: Send + Sync + Sized + 'static {
    /// An operation the system understands. Opaque to the engine.
    type Operation: Send + fmt::Debug + 'static;

    /// Handle for an accepted but unconfirmed operation.
    type Pending: Send + 'static;

    async fn submit(&self, operation: Self::Operation) -> Result<Self::Pending, EffectError>;

    async fn confirm(&self, pending: Self::Pending) -> Result<Receipt, EffectError>;

    /// Take an independent copy of the external state, if the system supports it.
    ///
    /// Returning `Ok(None)` means all paths share this ledger.
    async fn fork(&self) -> Result<Option<Self>, EffectError> {
        Ok(None)
    }
}

// ──────────────────────────────────────────────
// Session
// ──────────────────────────────────────────────

/// A connection to one ledger instance, with a gate that admits one
/// submission at a time.
///
/// Cloning a session shares both the ledger and its gate; [`Session::fork`]
/// produces a session over a forked ledger with a gate of its own.
pub struct Session<L> {
    ledger: Arc<L>,
    gate: Arc<Mutex<()>>,
}

impl<L> Clone for Session<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<L: Ledger> Session<L> {
    pub fn new(ledger: L) -> Self {
        Self::from_shared(Arc::new(ledger))
    }

    pub fn from_shared(ledger: Arc<L>) -> Self {
        Self {
            ledger,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Shared handle to the underlying ledger, as handed to graph callbacks.
    pub fn ledger(&self) -> Arc<L> {
        Arc::clone(&self.ledger)
    }

    /// Submit through the gate, then wait for confirmation outside of it.
    pub async fn submit_and_confirm(
        &self,
        operation: L::Operation,
    ) -> Result<Receipt, EffectError> {
        let pending = {
            let _turn = self.gate.lock().await;
            tracing::trace!(?operation, "submitting operation");
            self.ledger.submit(operation).await?
        };
        self.ledger.confirm(pending).await
    }

    /// A session over a fork of this ledger, or a clone of this session when
    /// the ledger cannot fork.
    pub async fn fork(&self) -> Result<Self, EffectError> {
        match self.ledger.fork().await? {
            Some(forked) => Ok(Self::new(forked)),
            None => Ok(self.clone()),
        }
    }

    /// Whether `other` talks to the same ledger instance.
    pub fn shares_ledger_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ledger, &other.ledger)
    }
}
