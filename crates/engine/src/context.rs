//! Path-local context threaded through a traversal.
//!
//! A [`Context`] is an append-only list of bindings plus the name of the
//! state the path currently sits in. Extending a context never touches the
//! receiver: every extension returns a fresh copy, so sibling paths can
//! never observe each other's bindings.
//!
//! A key may be bound more than once along a path (a subject re-produced by
//! a later transition, a dependency re-resolved at a later node). Lookups
//! return the most recent binding.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A single `key = value` binding recorded in a [`Context`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub key: String,
    pub value: Value,
}

/// Errors raised when reading typed values out of a context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// No binding exists for the key.
    #[error("context has no binding for '{0}'")]
    Missing(String),

    /// The binding exists but does not deserialize into the requested type.
    #[error("binding '{key}' has an unexpected shape: {source}")]
    Shape {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Accumulated, path-local state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Context {
    state: Option<String>,
    bindings: Vec<Binding>,
}

impl Context {
    /// An empty context with no current state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The state this context was last moved into, if any.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Returns a copy of this context extended with one binding.
    pub fn bind(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.bindings.push(Binding {
            key: key.into(),
            value,
        });
        next
    }

    /// Returns a copy of this context extended with every binding in `entries`,
    /// appended in iteration order.
    pub fn bind_all<I, K>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut next = self.clone();
        next.bindings
            .extend(entries.into_iter().map(|(key, value)| Binding {
                key: key.into(),
                value,
            }));
        next
    }

    /// Returns a copy of this context positioned at `state`.
    pub fn enter(&self, state: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.state = Some(state.into());
        next
    }

    /// The most recent value bound to `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .rev()
            .find(|b| b.key == key)
            .map(|b| &b.value)
    }

    /// Like [`Context::get`] but fails with [`ContextError::Missing`].
    pub fn require(&self, key: &str) -> Result<&Value, ContextError> {
        self.get(key)
            .ok_or_else(|| ContextError::Missing(key.to_string()))
    }

    /// Deserialize the most recent value bound to `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self.require(key)?;
        serde_json::from_value(value.clone()).map_err(|source| ContextError::Shape {
            key: key.to_string(),
            source,
        })
    }

    /// Number of bindings appended along the path, shadowed ones included.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Distinct keys bound in this context.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.bindings.iter().map(|b| b.key.as_str()).collect()
    }

    /// Every binding in the order it was appended.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Flattened JSON object view: one entry per key, latest value wins.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for b in &self.bindings {
            map.insert(b.key.clone(), b.value.clone());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_returns_new_context_and_leaves_receiver_untouched() {
        let base = Context::new().bind("a", json!(1));
        let extended = base.bind("b", json!(2));

        assert_eq!(base.len(), 1);
        assert!(base.get("b").is_none());
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get("a"), Some(&json!(1)));
    }

    #[test]
    fn latest_binding_wins_but_history_is_kept() {
        let ctx = Context::new()
            .bind("deposit", json!("0x01"))
            .bind("deposit", json!("0x02"));

        assert_eq!(ctx.get("deposit"), Some(&json!("0x02")));
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.keys().len(), 1);
        assert_eq!(ctx.to_json(), json!({"deposit": "0x02"}));
    }

    #[test]
    fn enter_moves_state_without_adding_bindings() {
        let ctx = Context::new().bind("a", json!(1)).enter("active");
        assert_eq!(ctx.state(), Some("active"));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn typed_reads_report_missing_and_shape_errors() {
        let ctx = Context::new().bind("lot", json!(100_000u64));

        let lot: u64 = ctx.get_as("lot").unwrap();
        assert_eq!(lot, 100_000);

        assert!(matches!(
            ctx.get_as::<u64>("fee"),
            Err(ContextError::Missing(key)) if key == "fee"
        ));
        assert!(matches!(
            ctx.get_as::<String>("lot"),
            Err(ContextError::Shape { .. })
        ));
    }

    #[test]
    fn bind_all_appends_in_order() {
        let ctx = Context::new().bind_all(vec![("x", json!(1)), ("y", json!(2))]);
        let keys: Vec<&str> = ctx.bindings().iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["x", "y"]);
    }
}
