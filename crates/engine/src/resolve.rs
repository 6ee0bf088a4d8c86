//! Dependency resolution.
//!
//! All resolvers of a node see the same input context and run concurrently.
//! The resulting context appends their values in declaration order, so the
//! shape of the output depends only on the node, never on completion order.

use std::sync::Arc;

use futures::future::join_all;

use crate::context::Context;
use crate::error::{Failure, StepResult};
use crate::graph::StateNode;
use crate::ledger::Ledger;

/// Resolve every dependency of `node` against `ctx`.
///
/// Every resolver is driven to completion even when one fails, so the log
/// shows each broken dependency. The reported failure is the first one in
/// declaration order.
pub async fn resolve_dependencies<L: Ledger>(
    node: &StateNode<L>,
    ledger: Arc<L>,
    ctx: &Context,
) -> StepResult<Context> {
    let deps = node.dependencies();
    if deps.is_empty() {
        return Ok(ctx.clone());
    }

    let results = join_all(
        deps.iter()
            .map(|(_, resolver)| resolver(Arc::clone(&ledger), ctx.clone())),
    )
    .await;

    let mut resolved = Vec::with_capacity(deps.len());
    let mut first_failure = None;
    for ((name, _), result) in deps.iter().zip(results) {
        match result {
            Ok(value) => {
                tracing::debug!(state = node.name(), dependency = %name, %value, "resolved");
                resolved.push((name.clone(), value));
            }
            Err(e) => {
                let cause = format!("{e:#}");
                tracing::warn!(
                    state = node.name(),
                    dependency = %name,
                    %cause,
                    "dependency failed"
                );
                first_failure.get_or_insert(Failure::DependencyResolution {
                    state: node.name().to_string(),
                    name: name.clone(),
                    cause,
                });
            }
        }
    }

    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(ctx.bind_all(resolved)),
    }
}
