//! gRPC service/client glue for the node job protocol.
//!
//! RPC schema source: `proto/fanout_job.proto`.
//!
//! RPCs (generated under [`v1`]):
//! - `ExecuteJob`: units travel as JSON, direct buckets as Arrow IPC
//! - `CloseContext`
//! - `PushBucket`

use std::collections::HashMap;
use std::sync::Arc;

use fanout_common::{FanoutError, JobId, NodeId, Result, UnitId};
use fanout_planner::ExecutionUnit;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, async_trait};

use crate::node::NodeService;
use crate::transport::{
    CloseContextRequest, CloseContextResponse, JobRequest, JobResponse, JobTransport, PushAck,
    PushDelivery, PushPayload,
};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("fanout.job.v1");
}

pub use v1::job_service_client::JobServiceClient;
pub use v1::job_service_server::{JobService, JobServiceServer};

#[derive(Clone, Debug)]
/// gRPC front of a [`NodeService`].
pub struct NodeJobService {
    node: Arc<NodeService>,
}

impl NodeJobService {
    pub fn new(node: Arc<NodeService>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl JobService for NodeJobService {
    async fn execute_job(
        &self,
        request: Request<v1::ExecuteJobRequest>,
    ) -> std::result::Result<Response<v1::ExecuteJobResponse>, Status> {
        let request = job_request_from_proto(request.into_inner()).map_err(to_status)?;
        let response = self.node.execute_job(request).await.map_err(to_status)?;
        Ok(Response::new(proto_job_response(response)))
    }

    async fn close_context(
        &self,
        request: Request<v1::CloseContextRequest>,
    ) -> std::result::Result<Response<v1::CloseContextResponse>, Status> {
        let req = request.into_inner();
        let job_id = JobId::parse(&req.job_id).map_err(to_status)?;
        let response = self.node.close_context(CloseContextRequest {
            job_id,
            unit_id: UnitId(req.unit_id),
        });
        Ok(Response::new(v1::CloseContextResponse {
            closed: response.closed,
        }))
    }

    async fn push_bucket(
        &self,
        request: Request<v1::PushBucketRequest>,
    ) -> std::result::Result<Response<v1::PushBucketResponse>, Status> {
        let delivery = push_delivery_from_proto(request.into_inner()).map_err(to_status)?;
        let ack = self.node.push_bucket(delivery).map_err(to_status)?;
        Ok(Response::new(v1::PushBucketResponse {
            need_more: ack.need_more,
        }))
    }
}

/// Job transport over gRPC, one lazily connected client per peer.
#[derive(Debug)]
pub struct GrpcJobTransport {
    endpoints: HashMap<NodeId, String>,
    clients: Mutex<HashMap<NodeId, JobServiceClient<Channel>>>,
}

impl GrpcJobTransport {
    pub fn new(endpoints: HashMap<NodeId, String>) -> Self {
        Self {
            endpoints,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Parse `id=endpoint` pairs separated by commas.
    pub fn parse_peers(raw: &str) -> Result<HashMap<NodeId, String>> {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (id, endpoint) = pair.split_once('=').ok_or_else(|| {
                    FanoutError::InvalidConfig(format!("peer '{pair}' is not id=endpoint"))
                })?;
                Ok((NodeId::new(id.trim()), endpoint.trim().to_string()))
            })
            .collect()
    }

    async fn client(&self, node: &NodeId) -> Result<JobServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(node) {
            return Ok(client.clone());
        }
        let endpoint = self
            .endpoints
            .get(node)
            .ok_or_else(|| FanoutError::remote_unavailable(node, "no endpoint configured"))?;
        let client = JobServiceClient::connect(endpoint.clone())
            .await
            .map_err(|e| FanoutError::remote_unavailable(node, format!("grpc connect failed: {e}")))?;
        clients.insert(node.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl JobTransport for GrpcJobTransport {
    async fn execute_job(&self, node: &NodeId, request: JobRequest) -> Result<JobResponse> {
        let mut client = self.client(node).await?;
        let response = client
            .execute_job(proto_job_request(&request)?)
            .await
            .map_err(|s| from_status(node, s))?
            .into_inner();
        Ok(job_response_from_proto(response))
    }

    async fn close_context(
        &self,
        node: &NodeId,
        request: CloseContextRequest,
    ) -> Result<CloseContextResponse> {
        let mut client = self.client(node).await?;
        let response = client
            .close_context(v1::CloseContextRequest {
                job_id: request.job_id.to_string(),
                unit_id: request.unit_id.0,
            })
            .await
            .map_err(|s| from_status(node, s))?
            .into_inner();
        Ok(CloseContextResponse {
            closed: response.closed,
        })
    }

    async fn push_bucket(&self, node: &NodeId, delivery: PushDelivery) -> Result<PushAck> {
        let mut client = self.client(node).await?;
        let response = client
            .push_bucket(proto_push_delivery(delivery))
            .await
            .map_err(|s| from_status(node, s))?
            .into_inner();
        Ok(PushAck {
            need_more: response.need_more,
        })
    }
}

fn proto_job_request(request: &JobRequest) -> Result<v1::ExecuteJobRequest> {
    let units_json = serde_json::to_vec(&request.units)
        .map_err(|e| FanoutError::Execution(format!("unit encoding failed: {e}")))?;
    Ok(v1::ExecuteJobRequest {
        job_id: request.job_id.to_string(),
        units_json,
        push_target: request.push_target.as_ref().map(|n| n.as_str().to_string()),
        merge_hosts: request
            .merge_hosts
            .iter()
            .map(|(unit, node)| (unit.0, node.as_str().to_string()))
            .collect(),
    })
}

fn job_request_from_proto(req: v1::ExecuteJobRequest) -> Result<JobRequest> {
    let units: Vec<ExecutionUnit> = serde_json::from_slice(&req.units_json)
        .map_err(|e| FanoutError::ProtocolViolation(format!("undecodable units: {e}")))?;
    Ok(JobRequest {
        job_id: JobId::parse(&req.job_id)?,
        units,
        push_target: req.push_target.map(NodeId::new),
        merge_hosts: req
            .merge_hosts
            .into_iter()
            .map(|(unit, node)| (UnitId(unit), NodeId::new(node)))
            .collect(),
    })
}

fn proto_job_response(response: JobResponse) -> v1::ExecuteJobResponse {
    match response.direct_buckets {
        Some(buckets) => v1::ExecuteJobResponse {
            direct: true,
            buckets: buckets
                .into_iter()
                .map(|payload| v1::DirectBucket { payload })
                .collect(),
        },
        None => v1::ExecuteJobResponse {
            direct: false,
            buckets: Vec::new(),
        },
    }
}

fn job_response_from_proto(response: v1::ExecuteJobResponse) -> JobResponse {
    if !response.direct {
        // inline buckets without the direct flag still reach the listener
        return JobResponse {
            direct_buckets: (!response.buckets.is_empty())
                .then(|| response.buckets.into_iter().map(|b| b.payload).collect()),
        };
    }
    JobResponse::direct(response.buckets.into_iter().map(|b| b.payload).collect())
}

fn proto_push_delivery(delivery: PushDelivery) -> v1::PushBucketRequest {
    let payload = match delivery.payload {
        PushPayload::Page { bucket, is_last } => {
            v1::push_bucket_request::Payload::Page(v1::Page { bucket, is_last })
        }
        PushPayload::Failure { message } => v1::push_bucket_request::Payload::Failure(message),
    };
    v1::PushBucketRequest {
        job_id: delivery.job_id.to_string(),
        target: delivery.target.0,
        producer_index: delivery.producer_index as u64,
        payload: Some(payload),
    }
}

fn push_delivery_from_proto(req: v1::PushBucketRequest) -> Result<PushDelivery> {
    let payload = match req.payload {
        Some(v1::push_bucket_request::Payload::Page(page)) => PushPayload::Page {
            bucket: page.bucket,
            is_last: page.is_last,
        },
        Some(v1::push_bucket_request::Payload::Failure(message)) => {
            PushPayload::Failure { message }
        }
        None => {
            return Err(FanoutError::ProtocolViolation(
                "push delivery without payload".to_string(),
            ));
        }
    };
    let producer_index = usize::try_from(req.producer_index)
        .map_err(|e| FanoutError::ProtocolViolation(format!("producer index: {e}")))?;
    Ok(PushDelivery {
        job_id: JobId::parse(&req.job_id)?,
        target: UnitId(req.target),
        producer_index,
        payload,
    })
}

fn to_status(err: FanoutError) -> Status {
    match err {
        FanoutError::InvalidConfig(msg) => Status::invalid_argument(msg),
        FanoutError::ProtocolViolation(msg) => Status::failed_precondition(msg),
        FanoutError::RemoteUnavailable { node, message } => {
            Status::unavailable(format!("{node}: {message}"))
        }
        FanoutError::LocalExecution(msg) => Status::aborted(msg),
        FanoutError::Unsupported(msg) => Status::unimplemented(msg),
        FanoutError::CircuitBreaking { breaker, message } => {
            Status::resource_exhausted(format!("[{breaker}] {message}"))
        }
        err @ FanoutError::CleanupFailure { .. } => Status::internal(err.to_string()),
        FanoutError::Execution(msg) => Status::internal(msg),
    }
}

fn from_status(node: &NodeId, status: Status) -> FanoutError {
    let msg = status.message().to_string();
    match status.code() {
        tonic::Code::InvalidArgument => FanoutError::InvalidConfig(msg),
        tonic::Code::FailedPrecondition => FanoutError::ProtocolViolation(msg),
        tonic::Code::Aborted => FanoutError::LocalExecution(msg),
        tonic::Code::Unimplemented => FanoutError::Unsupported(msg),
        tonic::Code::ResourceExhausted => FanoutError::CircuitBreaking {
            breaker: node.to_string(),
            message: msg,
        },
        tonic::Code::Internal => FanoutError::Execution(msg),
        _ => FanoutError::remote_unavailable(node, format!("{:?}: {msg}", status.code())),
    }
}
