//! A scripted in-memory ledger.
//!
//! Every operation carries its own outcome, which makes it convenient for
//! exercising graphs whose external system is not available: an action that
//! should succeed submits [`ScriptedCall::Emit`], one that should fail
//! submits [`ScriptedCall::Revert`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ledger::{EffectError, EventRecord, Ledger, Receipt};

/// Operation understood by [`ScriptedLedger`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedCall {
    /// Confirm successfully with these events.
    Emit(Vec<EventRecord>),
    /// Accept, then fail confirmation.
    Revert(String),
    /// Refuse at submission.
    Refuse(String),
    /// Fail submission as if the system could not be reached.
    Unreachable(String),
    /// Accept, then wait this long before confirming with no events.
    Stall(Duration),
}

impl ScriptedCall {
    pub fn emit(events: Vec<EventRecord>) -> Self {
        ScriptedCall::Emit(events)
    }

    pub fn revert(reason: impl Into<String>) -> Self {
        ScriptedCall::Revert(reason.into())
    }
}

/// Counters shared by a ledger and all of its forks.
#[derive(Debug, Default)]
pub struct ScriptedStats {
    pub submitted: AtomicUsize,
    pub confirmed: AtomicUsize,
    pub forks: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

/// In-memory [`Ledger`] whose operations script their own outcome.
#[derive(Debug)]
pub struct ScriptedLedger {
    nonce: AtomicU64,
    forkable: bool,
    submit_delay: Duration,
    stats: Arc<ScriptedStats>,
}

impl Default for ScriptedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self {
            nonce: AtomicU64::new(0),
            forkable: false,
            submit_delay: Duration::ZERO,
            stats: Arc::new(ScriptedStats::default()),
        }
    }

    /// Allow [`Ledger::fork`] to hand out independent copies.
    pub fn forkable(mut self) -> Self {
        self.forkable = true;
        self
    }

    /// Hold every submission for `delay`, widening the window in which
    /// overlapping submissions would be observable.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn stats(&self) -> Arc<ScriptedStats> {
        Arc::clone(&self.stats)
    }

    /// Next nonce that will be assigned.
    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    type Operation = ScriptedCall;
    type Pending = (u64, ScriptedCall);

    async fn submit(&self, operation: ScriptedCall) -> Result<Self::Pending, EffectError> {
        let stats = &self.stats;
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        match operation {
            ScriptedCall::Refuse(reason) => return Err(EffectError::Rejected(reason)),
            ScriptedCall::Unreachable(cause) => return Err(EffectError::Unavailable(cause)),
            _ => {}
        }
        stats.submitted.fetch_add(1, Ordering::SeqCst);
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        Ok((nonce, operation))
    }

    async fn confirm(&self, (nonce, operation): Self::Pending) -> Result<Receipt, EffectError> {
        let events = match operation {
            ScriptedCall::Emit(events) => events,
            ScriptedCall::Revert(reason) => return Err(EffectError::Reverted { reason }),
            ScriptedCall::Refuse(reason) => return Err(EffectError::Rejected(reason)),
            ScriptedCall::Unreachable(cause) => return Err(EffectError::Unavailable(cause)),
            ScriptedCall::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Vec::new()
            }
        };
        self.stats.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(Receipt {
            tx_hash: format!("0x{:064x}", nonce),
            block: nonce + 1,
            events,
        })
    }

    async fn fork(&self) -> Result<Option<Self>, EffectError> {
        if !self.forkable {
            return Ok(None);
        }
        self.stats.forks.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Self {
            nonce: AtomicU64::new(self.nonce()),
            forkable: true,
            submit_delay: self.submit_delay,
            stats: Arc::clone(&self.stats),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_confirms_with_events_and_sequential_nonces() {
        let ledger = ScriptedLedger::new();
        let first = ledger
            .submit(ScriptedCall::emit(vec![EventRecord::new("Funded")]))
            .await
            .unwrap();
        let second = ledger.submit(ScriptedCall::emit(vec![])).await.unwrap();
        assert_eq!(first.0, 0);
        assert_eq!(second.0, 1);

        let receipt = ledger.confirm(first).await.unwrap();
        assert!(receipt.event("Funded").is_some());
        assert_eq!(receipt.block, 1);
    }

    #[tokio::test]
    async fn revert_fails_at_confirmation_and_refuse_at_submission() {
        let ledger = ScriptedLedger::new();
        let pending = ledger.submit(ScriptedCall::revert("nope")).await.unwrap();
        assert_eq!(
            ledger.confirm(pending).await,
            Err(EffectError::Reverted {
                reason: "nope".to_string()
            })
        );
        assert!(matches!(
            ledger.submit(ScriptedCall::Refuse("closed".to_string())).await,
            Err(EffectError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn fork_only_when_enabled() {
        assert!(ScriptedLedger::new().fork().await.unwrap().is_none());

        let ledger = ScriptedLedger::new().forkable();
        ledger.submit(ScriptedCall::emit(vec![])).await.unwrap();
        let fork = ledger.fork().await.unwrap().unwrap();
        assert_eq!(fork.nonce(), 1);
        assert_eq!(ledger.stats().forks.load(Ordering::SeqCst), 1);
    }
}
