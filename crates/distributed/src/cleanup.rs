//! Best-effort close of retained contexts and hosted merges after a
//! failed job.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fanout_common::{FanoutError, JobId, NodeId, global_metrics};
use fanout_planner::ExecutionGraph;
use tracing::{debug, warn};

use crate::transport::{CloseContextRequest, JobTransport};

/// One close request per `(dispatched node, retained unit)` pair.
pub(crate) fn close_requests(
    job_id: JobId,
    graph: &ExecutionGraph,
    dispatched: &HashSet<NodeId>,
) -> Vec<(NodeId, CloseContextRequest)> {
    let mut pairs = BTreeSet::new();
    for (_, unit) in graph.units() {
        if !unit.requires_explicit_close() {
            continue;
        }
        for node in unit.nodes.iter().filter(|n| dispatched.contains(*n)) {
            pairs.insert((node.clone(), CloseContextRequest::for_unit(job_id, unit)));
        }
    }
    pairs.into_iter().collect()
}

/// Send all close requests concurrently. Failures are logged and counted,
/// never returned.
pub(crate) async fn close_contexts(
    transport: Arc<dyn JobTransport>,
    requests: Vec<(NodeId, CloseContextRequest)>,
    timeout: Duration,
) {
    let calls = requests.into_iter().map(|(node, request)| {
        let transport = Arc::clone(&transport);
        async move {
            let outcome = tokio::time::timeout(timeout, transport.close_context(&node, request))
                .await
                .map_err(|_| FanoutError::remote_unavailable(&node, "close context timed out"))
                .and_then(|r| r);
            match outcome {
                Ok(response) => {
                    debug!(
                        job_id = %request.job_id,
                        node = %node,
                        unit = %request.unit_id,
                        closed = response.closed,
                        "remote context closed"
                    );
                    global_metrics().record_close_context(node.as_str(), "success");
                }
                Err(err) => {
                    let err = FanoutError::CleanupFailure {
                        job_id: request.job_id.to_string(),
                        node: node.to_string(),
                        message: err.to_string(),
                    };
                    warn!(
                        job_id = %request.job_id,
                        node = %node,
                        unit = %request.unit_id,
                        error = %err,
                        "failed to close remote context"
                    );
                    global_metrics().record_close_context(node.as_str(), "failure");
                }
            }
        }
    });
    futures::future::join_all(calls).await;
}
