//! The per-node execution protocol.
//!
//! 1. Acquire an operation permit.
//! 2. Start a resource monitor for the node.
//! 3. Look the node up in the cache; a hit skips execution.
//! 4. Otherwise run the executor under the operation timeout.
//! 5. Store a successful result (dependencies = operation inputs).
//! 6. Stop the monitor, feed the profiler, release the permit.

use super::SchedulerContext;
use crate::builder::cache::CacheLookup;
use crate::builder::graph::BuildGraph;
use crate::error::{KilnError, Result};
use crate::events::{Event, EventType};
use crate::observability::OperationOutcome;
use crate::types::OperationResult;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs node `id` of `graph`. Unsuccessful executor results become
/// `ExecutionFailed` errors.
pub async fn run_node(
    ctx: Arc<SchedulerContext>,
    graph: Arc<BuildGraph>,
    id: usize,
    deadline: Option<tokio::time::Instant>,
    cancel: CancellationToken,
) -> Result<OperationResult> {
    let node = graph
        .get_node(id)
        .ok_or_else(|| KilnError::Internal(format!("node {} not in graph", id)))?;
    let operation = &node.operation;
    let platform = ctx.platform.to_string();

    let _permit = ctx.resources.acquire_op(deadline, &cancel).await?;
    let started = Instant::now();

    let monitor_key = format!("{}:{}:{}", platform, id, uuid::Uuid::new_v4());
    ctx.resources.start_monitor(&monitor_key);
    ctx.events.publish(
        Event::new(EventType::OperationStarted, &id.to_string(), &operation.describe())
            .with_metadata("platform", &platform)
            .with_metadata("key", &node.cache_key),
    );

    let outcome = execute_or_replay(&ctx, &graph, id, &cancel).await;

    let duration = started.elapsed();
    if let Some(summary) = ctx.resources.stop_monitor(&monitor_key) {
        ctx.resources.profiler().record(operation.op_type, duration, &summary);
    }

    let (event_type, op_outcome) = match &outcome {
        Ok(result) if result.cache_hit => (EventType::OperationCached, OperationOutcome::Cached),
        Ok(_) => (EventType::OperationCompleted, OperationOutcome::Executed),
        Err(_) => (EventType::OperationFailed, OperationOutcome::Failed),
    };
    ctx.collector.record_operation(&platform, operation.op_type, op_outcome, duration);

    let mut event = Event::new(event_type, &id.to_string(), &operation.describe())
        .with_metadata("platform", &platform)
        .with_metadata("duration_ms", duration.as_millis());
    if let Err(err) = &outcome {
        ctx.collector.record_error(err.kind().as_str());
        event = event.with_metadata("error", err);
    }
    ctx.events.publish(event);

    outcome
}

async fn execute_or_replay(
    ctx: &Arc<SchedulerContext>,
    graph: &BuildGraph,
    id: usize,
    cancel: &CancellationToken,
) -> Result<OperationResult> {
    let node = &graph.nodes[id];
    let operation = &node.operation;

    if !ctx.config.no_cache {
        if let Some(result) = lookup(ctx, &node.cache_key).await {
            debug!(node = id, key = %node.cache_key, "Cache hit");
            return Ok(result);
        }
    }

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(KilnError::cancelled(format!("{} interrupted", operation.describe())));
        }
        timed = tokio::time::timeout(
            ctx.config.op_timeout,
            ctx.executor.execute(operation, &ctx.work_dir, cancel),
        ) => timed.map_err(|_| KilnError::Timeout {
            scope: format!("operation {}", operation.describe()),
            after: ctx.config.op_timeout,
        })??,
    };

    if !result.success {
        return Err(KilnError::ExecutionFailed {
            operation: operation.describe(),
            reason: result.error.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    store(ctx, &node.cache_key, &result).await;
    Ok(result)
}

/// Cache read; any cache error counts as a miss.
async fn lookup(ctx: &Arc<SchedulerContext>, key: &str) -> Option<OperationResult> {
    let cache = ctx.cache.clone();
    let key_owned = key.to_string();
    let platform = ctx.platform.clone();
    let (dfh, ctxh) = (ctx.dockerfile_hash.clone(), ctx.context_hash.clone());

    let lookup = tokio::task::spawn_blocking(move || cache.get(&key_owned, &platform, &dfh, &ctxh)).await;
    let hit = match lookup {
        Ok(Ok(CacheLookup::Hit(result))) => Some(result),
        Ok(Ok(CacheLookup::Miss)) => None,
        Ok(Err(e)) => {
            warn!(key, error = %e, "Cache read failed, treating as miss");
            None
        }
        Err(e) => {
            warn!(key, error = %e, "Cache read task failed, treating as miss");
            None
        }
    };
    ctx.collector.record_cache_lookup(hit.is_some());
    hit
}

/// Cache write; failures are logged and ignored.
async fn store(ctx: &Arc<SchedulerContext>, key: &str, result: &OperationResult) {
    let cache = ctx.cache.clone();
    let key_owned = key.to_string();
    let result = result.clone();
    let platform = ctx.platform.clone();
    let (dfh, ctxh) = (ctx.dockerfile_hash.clone(), ctx.context_hash.clone());

    let written = tokio::task::spawn_blocking(move || {
        let deps = result.operation.inputs.clone();
        cache.set(&key_owned, &result, &platform, &dfh, &ctxh, &deps)
    })
    .await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(key, error = %e, "Cache write failed"),
        Err(e) => warn!(key, error = %e, "Cache write task failed"),
    }
}
