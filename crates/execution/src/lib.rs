#![deny(missing_docs)]

//! Node-local execution primitives used by the distributed coordinator.
//!
//! Architecture role:
//! - run collect units against a [`LocalExecutor`]
//! - apply flat projector chains
//! - move row buckets across the wire as Arrow IPC streams
//!
//! Key modules:
//! - [`bucket`]
//! - [`local`]
//! - [`projector`]
//! - [`streamer`]
//! - [`stream`]

#[allow(missing_docs)]
pub mod bucket;
#[allow(missing_docs)]
pub mod local;
#[allow(missing_docs)]
pub mod memory_executor;
#[allow(missing_docs)]
pub mod projector;
pub mod stream;
#[allow(missing_docs)]
pub mod streamer;

// Re-export only what you want at the crate root (no globs).
pub use bucket::Bucket;
pub use local::{LocalExecutor, run_collect};
pub use memory_executor::InMemoryExecutor;
pub use projector::{ProjectorChain, slice_rows};
pub use stream::{BucketStream, RecordBatchStream, SendableRecordBatchStream, bucket_stream};
pub use streamer::{Streamers, encode_bucket};
