//! Distributed job execution: fans a planned execution graph out to
//! cluster nodes, merges the returned buckets per execution group and
//! cleans up retained node contexts when a job fails.
//!
//! Key modules:
//! - [`coordinator`]: `JobCoordinator::start` and the job lifecycle
//! - [`node`]: the receiving side of job requests
//! - [`merge`]: per-group merge stages
//! - [`transport`]: the node protocol, in-process transport
//! - [`grpc`]: tonic service and client (feature `grpc`)

mod cleanup;
pub mod context;
pub mod coordinator;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod grouper;
mod handler_side;
mod listeners;
pub mod merge;
pub mod node;
pub mod slots;
pub mod transport;

pub use context::{JobContext, JobContextService};
pub use coordinator::{JobCoordinator, JobHandle};
pub use grouper::{AssignedUnit, NodeOperations};
pub use merge::{MergeStage, Paging};
pub use node::NodeService;
pub use slots::{ResultSlot, SlotWriter, TaskResult, result_slot};
pub use transport::{
    CloseContextRequest, CloseContextResponse, InProcessTransport, JobRequest, JobResponse,
    JobTransport, PushAck, PushDelivery, PushPayload,
};
