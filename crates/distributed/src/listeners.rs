//! Handling of job responses, one listener per dispatched node.

use std::collections::BTreeSet;
use std::sync::Arc;

use fanout_common::{FanoutError, JobId, NodeId, Result, global_metrics};
use tracing::{debug, warn};

use crate::merge::MergeStage;
use crate::transport::JobResponse;

/// What the coordinator expects back from one node.
#[derive(Debug, Clone)]
pub(crate) struct NodeExpectation {
    pub node: NodeId,
    /// Groups the node was assigned any unit of.
    pub groups: BTreeSet<usize>,
    /// `(group, producer index)` for every group whose final producer
    /// runs on the node, in assignment order. Direct replies carry their
    /// buckets in this order.
    pub producer_slots: Vec<(usize, usize)>,
}

impl NodeExpectation {
    /// Fail every group of this node. Groups the node produces for fail
    /// at its producer index, the others are aborted.
    pub fn fail_all(&self, stages: &[Arc<MergeStage>], cause: &FanoutError) {
        for group in &self.groups {
            let stage = &stages[*group];
            match self.producer_slots.iter().find(|(g, _)| g == group) {
                Some((_, producer)) => stage.fail(*producer, cause.clone()),
                None => stage.abort(cause.clone()),
            }
        }
    }
}

/// Direct response mode: write each inline bucket into its merge stage.
pub(crate) fn on_direct_response(
    job_id: JobId,
    expect: &NodeExpectation,
    stages: &[Arc<MergeStage>],
    outcome: Result<JobResponse>,
) {
    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            warn!(job_id = %job_id, node = %expect.node, error = %err, "job request failed");
            expect.fail_all(stages, &err);
            return;
        }
    };
    let Some(buckets) = response.direct_buckets else {
        let err = FanoutError::ProtocolViolation(format!(
            "node {} answered a direct response job without buckets",
            expect.node
        ));
        expect.fail_all(stages, &err);
        return;
    };
    let mut buckets = buckets.into_iter();
    for &(group, producer) in &expect.producer_slots {
        let stage = &stages[group];
        let Some(Some(payload)) = buckets.next() else {
            stage.fail(
                producer,
                FanoutError::ProtocolViolation(format!(
                    "node {} returned no bucket for group {group}",
                    expect.node
                )),
            );
            continue;
        };
        global_metrics().inc_buckets_received("direct");
        match stage.streamers().decode(&payload) {
            Ok(bucket) => {
                debug!(
                    job_id = %job_id,
                    node = %expect.node,
                    group,
                    producer,
                    rows = bucket.num_rows(),
                    "direct bucket received"
                );
                // a rejected bucket already failed its group
                let _ = stage.supply(producer, bucket, true);
            }
            Err(err) => stage.fail(producer, err),
        }
    }
}

/// Push mode: success only confirms dispatch; results arrive as pushes.
pub(crate) fn on_push_response(
    job_id: JobId,
    expect: &NodeExpectation,
    stages: &[Arc<MergeStage>],
    outcome: Result<JobResponse>,
) {
    match outcome {
        Ok(JobResponse {
            direct_buckets: None,
        }) => {
            debug!(job_id = %job_id, node = %expect.node, "job dispatched");
        }
        Ok(JobResponse {
            direct_buckets: Some(_),
        }) => {
            let err = FanoutError::ProtocolViolation(format!(
                "node {} answered a push job with inline buckets",
                expect.node
            ));
            expect.fail_all(stages, &err);
        }
        Err(err) => {
            warn!(job_id = %job_id, node = %expect.node, error = %err, "job request failed");
            expect.fail_all(stages, &err);
        }
    }
}
