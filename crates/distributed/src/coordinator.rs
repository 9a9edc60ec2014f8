//! Job coordinator: fans an execution graph out to cluster nodes.
//!
//! Flow of one job:
//! - group units by node and pick the delivery mode for the whole job;
//! - build one merge stage and result slot per execution group;
//! - start handler pseudo-node units in-process (direct mode) or register
//!   the merge stages in the local job context (push mode);
//! - send the merge units hosted by nodes first, then one job request per
//!   node for everything else, attaching a response listener to each;
//! - once every slot resolved, close retained contexts and hosted merges
//!   if the job failed, then release the group merges of the local job
//!   context. Retained outputs of a successful job stay for the fetch
//!   phase.
//!
//! Nothing is retried. Failures resolve only the slots of the groups they
//! belong to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_common::{
    CircuitBreaker, CoordinatorConfig, FanoutError, JobId, NodeId, Result, global_metrics,
};
use fanout_planner::{DeliveryMode, ExecutionGraph};
use futures::future::{join_all, try_join_all};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cleanup::{close_contexts, close_requests};
use crate::grouper::{AssignedUnit, NodeOperations, final_producer_slots, groups_of};
use crate::handler_side::{plan_handler_units, run_handler_unit};
use crate::listeners::{NodeExpectation, on_direct_response, on_push_response};
use crate::merge::{LOCAL_MERGE_OPERATION, MergeStage};
use crate::node::NodeService;
use crate::slots::{ResultSlot, TaskResult, result_slot};
use crate::transport::{JobRequest, JobTransport};

/// Starts jobs on behalf of the node it runs on.
pub struct JobCoordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn JobTransport>,
    local: Arc<NodeService>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("local_node_id", &self.config.local_node_id)
            .finish()
    }
}

/// Handles to a started job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    mode: DeliveryMode,
    slots: Vec<ResultSlot>,
    completion: JoinHandle<()>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// One slot per execution group, in group order.
    pub fn slots(&self) -> &[ResultSlot] {
        &self.slots
    }

    /// Wait for every group's outcome.
    pub async fn results(&self) -> Vec<Result<TaskResult>> {
        join_all(self.slots.iter().cloned()).await
    }

    /// Wait until cleanup ran and the group merges are released.
    pub async fn finished(self) -> Result<()> {
        self.completion
            .await
            .map_err(|e| FanoutError::Execution(format!("job completion task failed: {e}")))
    }
}

impl JobCoordinator {
    /// Coordinator on top of `local`, the node service of this process.
    ///
    /// Handler-side units run on the local node's executor and all
    /// merge stages account against its circuit breaker.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn JobTransport>,
        local: Arc<NodeService>,
    ) -> Self {
        let breaker = Arc::clone(local.breaker());
        Self {
            config,
            transport,
            local,
            breaker,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Start `graph`.
    ///
    /// Returns immediately with one result slot per group. Unsupported
    /// graphs are rejected before anything runs.
    pub fn start(&self, graph: ExecutionGraph) -> Result<JobHandle> {
        let mode = graph.delivery_mode()?;
        let mut ops = NodeOperations::group_by_node(&graph);
        let handler_units = match ops.remove(&NodeId::handler()) {
            Some(assigned) => plan_handler_units(&graph, mode, assigned)?,
            None => Vec::new(),
        };
        let merge_ops = ops.split_off_merges();

        let job_id = JobId::new();
        let metrics = global_metrics();
        metrics.inc_jobs_started(mode.as_str());
        info!(
            job_id = %job_id,
            mode = mode.as_str(),
            groups = graph.groups().len(),
            nodes = ops.len(),
            merge_hosts = merge_ops.len(),
            "starting job"
        );

        let mut stages = Vec::with_capacity(graph.groups().len());
        let mut slots = Vec::with_capacity(graph.groups().len());
        for (idx, (group, spec)) in graph.groups().iter().zip(graph.merge_specs()).enumerate() {
            let (writer, slot) = result_slot(idx);
            let accounting = self.breaker.context_for(spec.unit_id, LOCAL_MERGE_OPERATION);
            stages.push(MergeStage::new(
                job_id,
                idx,
                spec,
                group.producer_count(),
                graph.result_kind(),
                accounting,
                writer,
            ));
            slots.push(slot);
        }
        for stage in stages.iter().filter(|s| s.producer_count() == 0) {
            stage.finish();
        }

        if mode == DeliveryMode::Push {
            self.local.contexts().create_job(job_id, &stages)?;
        }

        for handler_unit in handler_units {
            let stage = Arc::clone(&stages[handler_unit.group]);
            tokio::spawn(run_handler_unit(
                job_id,
                self.local.executor(),
                Arc::clone(&self.breaker),
                handler_unit,
                stage,
            ));
        }

        let merge_hosts = graph.merge_hosts();
        let plan = |node: NodeId, assigned: Vec<AssignedUnit>| {
            let expect = NodeExpectation {
                groups: groups_of(&assigned),
                producer_slots: final_producer_slots(&graph, &node, &assigned),
                node,
            };
            let units = assigned.into_iter().map(|a| a.unit).collect();
            let request = match mode {
                DeliveryMode::Push => {
                    JobRequest::push(job_id, units, self.config.local_node_id.clone())
                        .with_merge_hosts(merge_hosts.clone())
                }
                DeliveryMode::DirectResponse => JobRequest::direct(job_id, units),
            };
            NodeDispatch { expect, request }
        };
        let first = merge_ops.into_iter().map(|(n, a)| plan(n, a)).collect::<Vec<_>>();
        let rest = ops.into_iter().map(|(n, a)| plan(n, a)).collect::<Vec<_>>();
        let dispatched = first
            .iter()
            .chain(&rest)
            .map(|d| d.expect.node.clone())
            .collect::<HashSet<_>>();

        let dispatcher = Arc::new(Dispatcher {
            job_id,
            mode,
            local_node_id: self.config.local_node_id.clone(),
            transport: Arc::clone(&self.transport),
            local: Arc::clone(&self.local),
            stages,
            timeout: self.config.job_request_timeout(),
        });
        tokio::spawn(async move {
            // merge units exist before any page is pushed into them
            join_all(first.into_iter().map(|d| Arc::clone(&dispatcher).send(d))).await;
            for d in rest {
                tokio::spawn(Arc::clone(&dispatcher).send(d));
            }
        });

        let completion = {
            let slots = slots.clone();
            let transport = Arc::clone(&self.transport);
            let local = Arc::clone(&self.local);
            let local_node_id = self.config.local_node_id.clone();
            let close_timeout = self.config.close_context_timeout();
            tokio::spawn(async move {
                if let Err(err) = try_join_all(slots.iter().cloned()).await {
                    warn!(job_id = %job_id, error = %err, "job failed, closing retained contexts");
                    let (own, remote): (Vec<_>, Vec<_>) =
                        close_requests(job_id, &graph, &dispatched)
                            .into_iter()
                            .partition(|(node, _)| *node == local_node_id);
                    for (_, request) in own {
                        local.close_context(request);
                    }
                    close_contexts(transport, remote, close_timeout).await;
                }
                // pushes for still running groups go to the local context
                join_all(slots.iter().cloned()).await;
                if mode == DeliveryMode::Push {
                    let group_merges = graph.merge_specs().iter().map(|s| s.unit_id);
                    local.contexts().release_merges(&job_id, group_merges);
                }
                info!(job_id = %job_id, "job finished");
            })
        };

        Ok(JobHandle {
            job_id,
            mode,
            slots,
            completion,
        })
    }
}

/// Job request for one node and what its answer resolves.
struct NodeDispatch {
    expect: NodeExpectation,
    request: JobRequest,
}

/// Sends the job requests of one job and hands answers to the listeners.
struct Dispatcher {
    job_id: JobId,
    mode: DeliveryMode,
    local_node_id: NodeId,
    transport: Arc<dyn JobTransport>,
    local: Arc<NodeService>,
    stages: Vec<Arc<MergeStage>>,
    timeout: Duration,
}

impl Dispatcher {
    async fn send(self: Arc<Self>, dispatch: NodeDispatch) {
        let NodeDispatch { expect, request } = dispatch;
        let node = &expect.node;
        if self.mode == DeliveryMode::Push && *node == self.local_node_id {
            let outcome = self.local.execute_job(request).await;
            on_push_response(self.job_id, &expect, &self.stages, outcome);
            return;
        }
        let started = Instant::now();
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.transport.execute_job(node, request))
            .await
            .map_err(|_| {
                FanoutError::remote_unavailable(
                    node,
                    format!("job request timed out after {timeout:?}"),
                )
            })
            .and_then(|r| r);
        let outcome_label = match &outcome {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        global_metrics().record_job_request(
            node.as_str(),
            self.mode.as_str(),
            outcome_label,
            started.elapsed().as_secs_f64(),
        );
        match self.mode {
            DeliveryMode::DirectResponse => {
                on_direct_response(self.job_id, &expect, &self.stages, outcome)
            }
            DeliveryMode::Push => on_push_response(self.job_id, &expect, &self.stages, outcome),
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
