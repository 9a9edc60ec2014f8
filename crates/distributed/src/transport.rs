//! Node-to-node job protocol and its in-process transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};

use fanout_common::{FanoutError, JobId, NodeId, Result, UnitId};
use fanout_planner::ExecutionUnit;
use serde::{Deserialize, Serialize};
use tonic::async_trait;

use crate::node::NodeService;

/// Units one node runs for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub units: Vec<ExecutionUnit>,
    /// Push mode: node whose merge stages receive the pages.
    pub push_target: Option<NodeId>,
    /// Push mode: node hosting each merge unit of the job. Pages for a
    /// merge unit missing here go to `push_target`.
    #[serde(default)]
    pub merge_hosts: BTreeMap<UnitId, NodeId>,
}

impl JobRequest {
    pub fn direct(job_id: JobId, units: Vec<ExecutionUnit>) -> Self {
        Self {
            job_id,
            units,
            push_target: None,
            merge_hosts: BTreeMap::new(),
        }
    }

    pub fn push(job_id: JobId, units: Vec<ExecutionUnit>, target: NodeId) -> Self {
        Self {
            job_id,
            units,
            push_target: Some(target),
            merge_hosts: BTreeMap::new(),
        }
    }

    pub fn with_merge_hosts(mut self, merge_hosts: BTreeMap<UnitId, NodeId>) -> Self {
        self.merge_hosts = merge_hosts;
        self
    }
}

/// Reply to a [`JobRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResponse {
    /// Direct mode only: one encoded bucket per direct-response unit, in
    /// request order. `None` entries mean the node produced nothing.
    pub direct_buckets: Option<Vec<Option<Vec<u8>>>>,
}

impl JobResponse {
    pub fn direct(buckets: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            direct_buckets: Some(buckets),
        }
    }

    pub fn dispatched() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPayload {
    Page { bucket: Vec<u8>, is_last: bool },
    Failure { message: String },
}

/// One page pushed into a merge unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDelivery {
    pub job_id: JobId,
    /// Merge unit receiving the page: a group merge on the coordinating
    /// node or a merge unit hosted by a node.
    pub target: UnitId,
    pub producer_index: usize,
    pub payload: PushPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    pub need_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloseContextRequest {
    pub job_id: JobId,
    pub unit_id: UnitId,
}

impl CloseContextRequest {
    pub fn for_unit(job_id: JobId, unit: &ExecutionUnit) -> Self {
        Self {
            job_id,
            unit_id: unit.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseContextResponse {
    /// `false` when no such context existed.
    pub closed: bool,
}

#[async_trait]
/// Transport contract between the coordinator and cluster nodes.
pub trait JobTransport: Send + Sync {
    /// Run `request` on `node`.
    async fn execute_job(&self, node: &NodeId, request: JobRequest) -> Result<JobResponse>;
    /// Close a retained context on `node`.
    async fn close_context(
        &self,
        node: &NodeId,
        request: CloseContextRequest,
    ) -> Result<CloseContextResponse>;
    /// Push a page into a merge stage hosted on `node`.
    async fn push_bucket(&self, node: &NodeId, delivery: PushDelivery) -> Result<PushAck>;
}

/// Transport to node services living in the same process.
#[derive(Debug, Default)]
pub struct InProcessTransport {
    nodes: RwLock<HashMap<NodeId, Weak<NodeService>>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<NodeService>) {
        self.nodes
            .write()
            .expect("transport registry lock poisoned")
            .insert(node.node_id().clone(), Arc::downgrade(node));
    }

    pub fn deregister(&self, node: &NodeId) {
        self.nodes
            .write()
            .expect("transport registry lock poisoned")
            .remove(node);
    }

    fn lookup(&self, node: &NodeId) -> Result<Arc<NodeService>> {
        self.nodes
            .read()
            .expect("transport registry lock poisoned")
            .get(node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| FanoutError::remote_unavailable(node, "node is not reachable"))
    }
}

#[async_trait]
impl JobTransport for InProcessTransport {
    async fn execute_job(&self, node: &NodeId, request: JobRequest) -> Result<JobResponse> {
        self.lookup(node)?.execute_job(request).await
    }

    async fn close_context(
        &self,
        node: &NodeId,
        request: CloseContextRequest,
    ) -> Result<CloseContextResponse> {
        Ok(self.lookup(node)?.close_context(request))
    }

    async fn push_bucket(&self, node: &NodeId, delivery: PushDelivery) -> Result<PushAck> {
        self.lookup(node)?.push_bucket(delivery)
    }
}
