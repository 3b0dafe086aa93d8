//! Pipelined dispatch: a node runs as soon as its dependencies completed.

use super::node::run_node;
use super::{ScheduleReport, SchedulerContext};
use crate::builder::graph::BuildGraph;
use crate::error::KilnError;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(super) async fn run(
    ctx: &Arc<SchedulerContext>,
    graph: &Arc<BuildGraph>,
    cancel: &CancellationToken,
    report: &mut ScheduleReport,
) {
    let run_cancel = cancel.child_token();
    let mut waiting: Vec<usize> = graph.nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut ready: VecDeque<usize> = graph.roots.iter().copied().collect();
    let mut tasks = JoinSet::new();

    loop {
        while report.failure.is_none() && !run_cancel.is_cancelled() {
            let Some(id) = ready.pop_front() else { break };
            debug!(node = id, "Dispatching ready node");
            report.mark_running(id);
            let (ctx, graph, token) = (Arc::clone(ctx), Arc::clone(graph), run_cancel.clone());
            tasks.spawn(async move { (id, run_node(ctx, graph, id, None, token).await) });
        }

        let Some(joined) = tasks.join_next().await else { break };
        match joined {
            Ok((id, outcome)) => {
                if report.record(id, outcome) {
                    for &dependent in graph.get_dependents(id) {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 {
                            ready.push_back(dependent);
                        }
                    }
                } else {
                    run_cancel.cancel();
                }
            }
            Err(e) => {
                report.fail(KilnError::Internal(format!("operation task failed: {}", e)));
                run_cancel.cancel();
            }
        }
    }

    if cancel.is_cancelled() {
        report.fail(KilnError::cancelled("build cancelled"));
    }
}
