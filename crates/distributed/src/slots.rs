//! Write-once result slots, one per execution group.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fanout_common::{FanoutError, Result};
use fanout_execution::{Bucket, SendableRecordBatchStream, bucket_stream};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

/// Final result of one execution group.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// Merged rows.
    Rows {
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    },
    /// Affected row count of a DML group.
    RowCount(i64),
}

impl TaskResult {
    pub fn num_rows(&self) -> usize {
        match self {
            TaskResult::Rows { batches, .. } => batches.iter().map(RecordBatch::num_rows).sum(),
            TaskResult::RowCount(_) => 1,
        }
    }

    pub fn row_count(&self) -> Option<i64> {
        match self {
            TaskResult::RowCount(n) => Some(*n),
            TaskResult::Rows { .. } => None,
        }
    }

    pub fn batches(&self) -> &[RecordBatch] {
        match self {
            TaskResult::Rows { batches, .. } => batches,
            TaskResult::RowCount(_) => &[],
        }
    }

    /// Rows of a merged result, ready to be pushed on.
    pub fn into_bucket(self) -> Result<Bucket> {
        match self {
            TaskResult::Rows { schema, batches } => Ok(Bucket::new(schema, batches)),
            TaskResult::RowCount(_) => Err(FanoutError::Execution(
                "a row count result carries no rows to forward".to_string(),
            )),
        }
    }

    /// Stream view of a rows result; a row count streams nothing.
    pub fn into_stream(self) -> Option<SendableRecordBatchStream> {
        match self {
            TaskResult::Rows { schema, batches } => {
                Some(bucket_stream(Bucket::new(schema, batches)))
            }
            TaskResult::RowCount(_) => None,
        }
    }
}

type SlotOutcome = Result<TaskResult>;

/// Create the writer and the shareable reader of slot `index`.
pub fn result_slot(index: usize) -> (SlotWriter, ResultSlot) {
    let (tx, rx) = oneshot::channel::<SlotOutcome>();
    let fut: BoxFuture<'static, SlotOutcome> = Box::pin(rx.map(|r| {
        r.unwrap_or_else(|_| {
            Err(FanoutError::Execution(
                "result slot dropped without a result".to_string(),
            ))
        })
    }));
    (
        SlotWriter {
            index,
            tx: Mutex::new(Some(tx)),
        },
        ResultSlot {
            index,
            inner: fut.shared(),
        },
    )
}

/// Write side of a result slot. Only the first write lands.
#[derive(Debug)]
pub struct SlotWriter {
    index: usize,
    tx: Mutex<Option<oneshot::Sender<SlotOutcome>>>,
}

impl SlotWriter {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Resolve the slot. Returns `false` if it was already resolved.
    pub fn set(&self, outcome: SlotOutcome) -> bool {
        let tx = self.tx.lock().expect("result slot lock poisoned").take();
        match tx {
            // a dropped reader is not an error for the writer
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.tx.lock().expect("result slot lock poisoned").is_none()
    }
}

/// Read side of a result slot; clones observe the same resolution.
#[derive(Clone)]
pub struct ResultSlot {
    index: usize,
    inner: Shared<BoxFuture<'static, SlotOutcome>>,
}

impl std::fmt::Debug for ResultSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSlot")
            .field("index", &self.index)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl ResultSlot {
    /// Position of the group this slot belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_resolved(&self) -> bool {
        self.peek().is_some()
    }

    /// Outcome if already written, without waiting.
    pub fn peek(&self) -> Option<SlotOutcome> {
        self.inner.clone().now_or_never()
    }
}

impl Future for ResultSlot {
    type Output = SlotOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}
