//! Record-batch stream view over merged results.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fanout_common::Result;
use futures::Stream;

use crate::Bucket;

/// Batches paired with the schema every one of them carries.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Schema of the yielded batches.
    fn schema(&self) -> SchemaRef;
}

/// Boxed stream handed to callers of a finished group.
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Drains a materialized [`Bucket`] batch by batch.
pub struct BucketStream {
    schema: SchemaRef,
    pending: VecDeque<RecordBatch>,
}

impl BucketStream {
    /// Stream over the batches of `bucket`, in order.
    pub fn new(bucket: Bucket) -> Self {
        Self {
            schema: bucket.schema(),
            pending: bucket.into_batches().into(),
        }
    }
}

impl RecordBatchStream for BucketStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Stream for BucketStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.pending.pop_front().map(Ok))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}

/// Stream the batches of an already materialized bucket.
pub fn bucket_stream(bucket: Bucket) -> SendableRecordBatchStream {
    Box::pin(BucketStream::new(bucket))
}
