//! Level-synchronous dispatch.

use super::node::run_node;
use super::{level_concurrency, ScheduleReport, SchedulerContext};
use crate::builder::graph::BuildGraph;
use crate::error::KilnError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(super) async fn run(
    ctx: &Arc<SchedulerContext>,
    graph: &Arc<BuildGraph>,
    cancel: &CancellationToken,
    report: &mut ScheduleReport,
) {
    for (level, ids) in graph.levels.iter().enumerate() {
        if cancel.is_cancelled() {
            report.fail(KilnError::cancelled(format!("cancelled before level {}", level)));
            return;
        }

        let concurrency = level_concurrency(ctx.config.max_concurrent_ops, ids.len(), level);
        debug!(level, nodes = ids.len(), concurrency, "Dispatching level");

        let limiter = Arc::new(Semaphore::new(concurrency));
        let level_cancel = cancel.child_token();
        let deadline = tokio::time::Instant::now() + ctx.config.stage_timeout;
        let mut tasks = JoinSet::new();

        for &id in ids {
            report.mark_running(id);
            let (ctx, graph, limiter, token) =
                (Arc::clone(ctx), Arc::clone(graph), Arc::clone(&limiter), level_cancel.clone());
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(KilnError::cancelled("level aborted")),
                    slot = limiter.acquire_owned() => match slot {
                        Ok(_slot) => run_node(ctx, graph, id, Some(deadline), token).await,
                        Err(_) => Err(KilnError::Internal("level limiter closed".to_string())),
                    },
                };
                (id, outcome)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    if !report.record(id, outcome) {
                        level_cancel.cancel();
                    }
                }
                Ok(Some(Err(e))) => {
                    report.fail(KilnError::Internal(format!("operation task failed: {}", e)));
                    level_cancel.cancel();
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(level, timeout = ?ctx.config.stage_timeout, "Level timed out");
                    report.fail(KilnError::Timeout {
                        scope: format!("level {}", level),
                        after: ctx.config.stage_timeout,
                    });
                    level_cancel.cancel();
                    drain(&mut tasks, report).await;
                    break;
                }
            }
        }

        if report.failure.is_some() {
            return;
        }
    }
}

/// Waits for cancelled tasks so nothing outlives the level.
async fn drain(tasks: &mut JoinSet<(usize, crate::error::Result<crate::types::OperationResult>)>, report: &mut ScheduleReport) {
    while let Some(joined) = tasks.join_next().await {
        if let Ok((id, outcome)) = joined {
            report.record(id, outcome);
        }
    }
}
