//! Node runtime: executes job requests sent by a coordinator.
//!
//! Responsibilities:
//! - run the collect units of a [`JobRequest`] on the local executor;
//! - answer direct-response jobs with one encoded bucket per direct unit;
//! - push pages of push-mode units to the merge unit they target, awaiting
//!   each acknowledgement before the next page;
//! - host merge units of push-mode jobs and forward their merged rows;
//! - keep collect outputs for a later fetch phase until they are closed.
//!
//! Push-mode requests are acknowledged as soon as their units are
//! scheduled. Failures after that point travel as failure pages.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use fanout_common::{
    AccountingContext, CircuitBreaker, FanoutError, JobId, NodeConfig, NodeId, Result, UnitId,
};
use fanout_execution::{Bucket, LocalExecutor, encode_bucket, run_collect};
use fanout_planner::{CollectUnit, ExecutionUnit, ResultKind};
use tracing::{debug, error, info, warn};

use crate::context::JobContextService;
use crate::merge::MergeStage;
use crate::slots::{ResultSlot, TaskResult, result_slot};
use crate::transport::{
    CloseContextRequest, CloseContextResponse, JobRequest, JobResponse, JobTransport, PushAck,
    PushDelivery, PushPayload,
};

const COLLECT_OPERATION: &str = "collect";
/// Operation label of merge units hosted by a node.
pub const NODE_MERGE_OPERATION: &str = "nodeMerge";

/// Remote side of the job protocol on one node.
pub struct NodeService {
    config: NodeConfig,
    executor: Arc<dyn LocalExecutor>,
    transport: Arc<dyn JobTransport>,
    contexts: Arc<JobContextService>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("node_id", &self.config.node_id)
            .field("jobs", &self.contexts.len())
            .finish()
    }
}

impl NodeService {
    pub fn new(
        config: NodeConfig,
        executor: Arc<dyn LocalExecutor>,
        transport: Arc<dyn JobTransport>,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(
            format!("node-{}", config.node_id),
            config.breaker_limit_bytes,
        );
        Arc::new(Self {
            config,
            executor,
            transport,
            contexts: JobContextService::new(),
            breaker,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn executor(&self) -> Arc<dyn LocalExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn contexts(&self) -> &Arc<JobContextService> {
        &self.contexts
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run the units of `request`.
    pub async fn execute_job(&self, request: JobRequest) -> Result<JobResponse> {
        info!(
            job_id = %request.job_id,
            node = %self.config.node_id,
            units = request.units.len(),
            push = request.push_target.is_some(),
            "executing job request"
        );
        match request.push_target.clone() {
            Some(target) => self.start_push_job(request, target),
            None => self.run_direct_job(request).await,
        }
    }

    async fn run_direct_job(&self, request: JobRequest) -> Result<JobResponse> {
        for unit in &request.units {
            if unit.push_target().is_some() {
                return Err(FanoutError::ProtocolViolation(format!(
                    "unit {} pushes its rows but job {} has no push target",
                    unit.id, request.job_id
                )));
            }
            if unit.as_merge().is_some() {
                return Err(FanoutError::Unsupported(format!(
                    "merge unit {} of job {} needs a push-mode job",
                    unit.id, request.job_id
                )));
            }
        }
        let job_id = request.job_id;
        let reserved = self.reserve_retained(job_id, &request.units);
        let outcome = self.collect_direct(job_id, &request.units, &reserved).await;
        if outcome.is_err() {
            for unit in &reserved {
                self.contexts.discard_pending(&job_id, *unit);
            }
        }
        outcome.map(JobResponse::direct)
    }

    async fn collect_direct(
        &self,
        job_id: JobId,
        units: &[ExecutionUnit],
        reserved: &HashSet<UnitId>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let mut buckets = Vec::new();
        for unit in units {
            let bucket = self.collect(job_id, unit, reserved.contains(&unit.id)).await?;
            if unit.has_direct_response() {
                buckets.push(Some(encode_bucket(&bucket)?));
            }
        }
        Ok(buckets)
    }

    fn start_push_job(&self, request: JobRequest, target: NodeId) -> Result<JobResponse> {
        let node = self.node_id().clone();
        let job_id = request.job_id;
        for unit in &request.units {
            if unit.has_direct_response() {
                return Err(FanoutError::ProtocolViolation(format!(
                    "unit {} expects a direct response but job {job_id} pushes to {target}",
                    unit.id
                )));
            }
            if unit.push_target().is_some() && producer_index(unit, &node).is_none() {
                return Err(FanoutError::ProtocolViolation(format!(
                    "node {node} is not a producer of unit {}",
                    unit.id
                )));
            }
            if unit.as_merge().is_some() && unit.push_target().is_none() {
                return Err(FanoutError::ProtocolViolation(format!(
                    "merge unit {} of job {job_id} has nowhere to push its rows",
                    unit.id
                )));
            }
        }

        let reserved = self.reserve_retained(job_id, &request.units);
        let mut hosted = Vec::new();
        for unit in request.units.iter().filter(|u| u.as_merge().is_some()) {
            match self.host_merge(job_id, unit) {
                Ok(slot) => hosted.push((unit.clone(), slot)),
                Err(err) => {
                    for (unit, _) in &hosted {
                        self.contexts.release_merge(&job_id, unit.id);
                    }
                    for unit in &reserved {
                        self.contexts.discard_pending(&job_id, *unit);
                    }
                    return Err(err);
                }
            }
        }

        let worker = Arc::new(PushWorker {
            job_id,
            node,
            handler: target,
            routes: request.merge_hosts,
            config: self.config.clone(),
            executor: Arc::clone(&self.executor),
            transport: Arc::clone(&self.transport),
            contexts: Arc::clone(&self.contexts),
            breaker: Arc::clone(&self.breaker),
        });
        for (unit, slot) in hosted {
            tokio::spawn(Arc::clone(&worker).forward_merge(unit, slot));
        }
        for unit in request.units.into_iter().filter(ExecutionUnit::is_data_producer) {
            let retain = reserved.contains(&unit.id);
            tokio::spawn(Arc::clone(&worker).run(unit, retain));
        }
        Ok(JobResponse::dispatched())
    }

    /// Reserve retained outputs before any collect starts, so that a
    /// close arriving mid-collect is not lost.
    fn reserve_retained(&self, job_id: JobId, units: &[ExecutionUnit]) -> HashSet<UnitId> {
        units
            .iter()
            .filter(|u| u.as_collect().is_some_and(|c| c.keep_context_for_fetcher))
            .filter(|u| self.contexts.reserve(job_id, u.id))
            .map(|u| u.id)
            .collect()
    }

    fn host_merge(&self, job_id: JobId, unit: &ExecutionUnit) -> Result<ResultSlot> {
        let (Some(spec), Some(merge)) = (unit.hosted_merge_spec(), unit.as_merge()) else {
            return Err(FanoutError::Unsupported(format!(
                "unit {} is not a merge unit",
                unit.id
            )));
        };
        let (writer, slot) = result_slot(0);
        let accounting = self.breaker.context_for(unit.id, NODE_MERGE_OPERATION);
        let stage = MergeStage::new(
            job_id,
            0,
            &spec,
            merge.upstream_producers,
            ResultKind::Rows,
            accounting,
            writer,
        );
        if merge.upstream_producers == 0 {
            stage.finish();
        }
        self.contexts.register_merge(job_id, stage)?;
        debug!(
            job_id = %job_id,
            unit = %unit.id,
            producers = merge.upstream_producers,
            "hosting merge unit"
        );
        Ok(slot)
    }

    async fn collect(&self, job_id: JobId, unit: &ExecutionUnit, retain: bool) -> Result<Bucket> {
        collect_and_retain(
            self.executor.as_ref(),
            &self.contexts,
            &self.breaker,
            job_id,
            unit,
            retain,
        )
        .await
    }

    /// Close a retained context or hosted merge; unknown contexts answer
    /// `closed = false`.
    pub fn close_context(&self, request: CloseContextRequest) -> CloseContextResponse {
        CloseContextResponse {
            closed: self
                .contexts
                .close_context(&request.job_id, request.unit_id),
        }
    }

    /// Accept a page for a merge stage hosted by this node.
    pub fn push_bucket(&self, delivery: PushDelivery) -> Result<PushAck> {
        self.contexts.route_push(delivery)
    }
}

/// Run a collect unit. With `retain`, its output fills the reservation
/// made for it, or the reservation is given up if the collect fails.
async fn collect_and_retain(
    executor: &dyn LocalExecutor,
    contexts: &JobContextService,
    breaker: &Arc<CircuitBreaker>,
    job_id: JobId,
    unit: &ExecutionUnit,
    retain: bool,
) -> Result<Bucket> {
    let collect: &CollectUnit = unit.as_collect().ok_or_else(|| {
        FanoutError::Unsupported(format!("unit {} is not a collect unit", unit.id))
    })?;
    let accounting: AccountingContext = breaker.context_for(unit.id, COLLECT_OPERATION);
    let collected = run_collect(executor, job_id, unit.id, collect, &accounting).await;
    if retain {
        match &collected {
            Ok(bucket) => {
                contexts.retain(job_id, unit.id, bucket.clone());
            }
            Err(_) => contexts.discard_pending(&job_id, unit.id),
        }
    }
    collected
}

fn producer_index(unit: &ExecutionUnit, node: &NodeId) -> Option<usize> {
    unit.nodes.iter().position(|n| n == node)
}

/// Runs the push-mode units of one job request and streams their pages
/// to the merge units they target.
struct PushWorker {
    job_id: JobId,
    node: NodeId,
    /// Host of the group merges: the coordinating node.
    handler: NodeId,
    routes: BTreeMap<UnitId, NodeId>,
    config: NodeConfig,
    executor: Arc<dyn LocalExecutor>,
    transport: Arc<dyn JobTransport>,
    contexts: Arc<JobContextService>,
    breaker: Arc<CircuitBreaker>,
}

impl PushWorker {
    async fn run(self: Arc<Self>, unit: ExecutionUnit, retain: bool) {
        let collected = collect_and_retain(
            self.executor.as_ref(),
            &self.contexts,
            &self.breaker,
            self.job_id,
            &unit,
            retain,
        )
        .await;
        self.deliver(&unit, collected).await;
    }

    /// Wait for a hosted merge, then push its rows downstream.
    async fn forward_merge(self: Arc<Self>, unit: ExecutionUnit, slot: ResultSlot) {
        let merged = slot.await;
        self.contexts.release_merge(&self.job_id, unit.id);
        let merged = merged.and_then(TaskResult::into_bucket);
        debug!(
            job_id = %self.job_id,
            unit = %unit.id,
            ok = merged.is_ok(),
            "hosted merge resolved"
        );
        self.deliver(&unit, merged).await;
    }

    async fn deliver(&self, unit: &ExecutionUnit, outcome: Result<Bucket>) {
        let (Some(merge_unit), Some(producer)) =
            (unit.push_target(), producer_index(unit, &self.node))
        else {
            if let Err(err) = outcome {
                error!(job_id = %self.job_id, unit = %unit.id, error = %err, "unit failed");
            }
            return;
        };
        let pages = match outcome {
            Ok(bucket) if self.config.page_size_rows == 0 => vec![bucket],
            Ok(bucket) => bucket.into_pages(self.config.page_size_rows),
            Err(err) => {
                error!(job_id = %self.job_id, unit = %unit.id, error = %err, "unit failed");
                self.send(
                    merge_unit,
                    producer,
                    PushPayload::Failure {
                        message: err.to_string(),
                    },
                )
                .await
                .ok();
                return;
            }
        };

        let total = pages.len();
        for (idx, page) in pages.into_iter().enumerate() {
            let is_last = idx + 1 == total;
            let payload = match encode_bucket(&page) {
                Ok(bucket) => PushPayload::Page { bucket, is_last },
                Err(err) => PushPayload::Failure {
                    message: err.to_string(),
                },
            };
            let failed = matches!(payload, PushPayload::Failure { .. });
            match self.send(merge_unit, producer, payload).await {
                Ok(ack) if ack.need_more && !failed => continue,
                Ok(_) => {
                    if !is_last {
                        debug!(
                            job_id = %self.job_id,
                            unit = %unit.id,
                            page = idx,
                            "push target asked to stop"
                        );
                    }
                    return;
                }
                Err(err) => {
                    warn!(
                        job_id = %self.job_id,
                        unit = %unit.id,
                        target = %self.target_for(merge_unit),
                        error = %err,
                        "push failed"
                    );
                    return;
                }
            }
        }
    }

    fn target_for(&self, merge_unit: UnitId) -> &NodeId {
        self.routes.get(&merge_unit).unwrap_or(&self.handler)
    }

    async fn send(&self, merge_unit: UnitId, producer: usize, payload: PushPayload) -> Result<PushAck> {
        let delivery = PushDelivery {
            job_id: self.job_id,
            target: merge_unit,
            producer_index: producer,
            payload,
        };
        let target = self.target_for(merge_unit);
        // pages for the own node skip the transport
        if *target == self.node {
            return self.contexts.route_push(delivery);
        }
        tokio::time::timeout(
            self.config.push_timeout(),
            self.transport.push_bucket(target, delivery),
        )
        .await
        .map_err(|_| FanoutError::remote_unavailable(target, "push timed out"))?
    }
}

#[cfg(test)]
#[path = "node_tests.rs"]
mod tests;
