//! Handler-side merge stage of one execution group.
//!
//! A merge stage knows up front how many producers feed it. Each producer
//! supplies buckets at its producer index, the last one flagged `is_last`.
//! Once every producer drained, the buckets are concatenated in producer
//! order, ordered, limited and projected, and the group's result slot is
//! resolved. The first failure resolves the slot immediately; later
//! deliveries are told to stop.

use std::sync::{Arc, Mutex};

use arrow::array::{Array, Int64Array};
use arrow::compute::{SortColumn, concat_batches, lexsort_to_indices, take_record_batch};
use arrow_schema::SortOptions;
use fanout_common::{AccountingContext, FanoutError, JobId, Result, global_metrics};
use fanout_execution::{Bucket, ProjectorChain, Streamers, slice_rows};
use fanout_planner::{MergeSpec, ResultKind};
use tracing::debug;

use crate::slots::{SlotWriter, TaskResult};

/// Operation label used for accounting and metrics of handler merges.
pub const LOCAL_MERGE_OPERATION: &str = "localMerge";

/// Flow-control answer to a supplied bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// Keep sending pages.
    NeedMore,
    /// Stop: this producer drained or the group already resolved.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Pending,
    Drained,
    Failed,
}

#[derive(Debug)]
struct MergeState {
    producers: Vec<ProducerState>,
    buckets: Vec<Vec<Bucket>>,
    resolved: bool,
}

/// Paged merge sink feeding one result slot.
#[derive(Debug)]
pub struct MergeStage {
    job_id: JobId,
    group: usize,
    spec: MergeSpec,
    streamers: Streamers,
    result_kind: ResultKind,
    accounting: Mutex<Option<AccountingContext>>,
    state: Mutex<MergeState>,
    writer: SlotWriter,
}

impl MergeStage {
    pub fn new(
        job_id: JobId,
        group: usize,
        spec: &MergeSpec,
        producer_count: usize,
        result_kind: ResultKind,
        accounting: AccountingContext,
        writer: SlotWriter,
    ) -> Arc<Self> {
        global_metrics().operation_started(LOCAL_MERGE_OPERATION);
        Arc::new(Self {
            job_id,
            group,
            spec: spec.clone(),
            streamers: Streamers::new(spec.schema_ref()),
            result_kind,
            accounting: Mutex::new(Some(accounting)),
            state: Mutex::new(MergeState {
                producers: vec![ProducerState::Pending; producer_count],
                buckets: vec![Vec::new(); producer_count],
                resolved: false,
            }),
            writer,
        })
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn spec(&self) -> &MergeSpec {
        &self.spec
    }

    pub fn streamers(&self) -> &Streamers {
        &self.streamers
    }

    pub fn producer_count(&self) -> usize {
        self.lock_state().producers.len()
    }

    pub fn is_resolved(&self) -> bool {
        self.lock_state().resolved
    }

    /// Deliver a bucket for `producer`.
    ///
    /// Out-of-range producers, deliveries after a producer drained, schema
    /// mismatches and exceeded budgets fail the whole group and are
    /// returned as errors.
    pub fn supply(&self, producer: usize, bucket: Bucket, is_last: bool) -> Result<Paging> {
        let mut state = self.lock_state();
        let Some(current) = state.producers.get(producer).copied() else {
            let err = FanoutError::ProtocolViolation(format!(
                "group {} has {} producers, got a bucket for producer {producer}",
                self.group,
                state.producers.len()
            ));
            return Err(self.fail_locked(state, None, err));
        };
        if state.resolved || current == ProducerState::Failed {
            return Ok(Paging::Done);
        }
        if current == ProducerState::Drained {
            let err = FanoutError::ProtocolViolation(format!(
                "producer {producer} of group {} already delivered its last bucket",
                self.group
            ));
            return Err(self.fail_locked(state, Some(producer), err));
        }
        if bucket.schema().fields() != self.streamers.schema().fields() {
            let err = FanoutError::ProtocolViolation(format!(
                "producer {producer} of group {} sent rows of an unexpected type",
                self.group
            ));
            return Err(self.fail_locked(state, Some(producer), err));
        }
        if let Err(err) = self.charge(&bucket) {
            return Err(self.fail_locked(state, Some(producer), err));
        }

        debug!(
            job_id = %self.job_id,
            group = self.group,
            producer,
            rows = bucket.num_rows(),
            is_last,
            "bucket supplied"
        );
        state.buckets[producer].push(bucket);
        if !is_last {
            return Ok(Paging::NeedMore);
        }
        state.producers[producer] = ProducerState::Drained;
        if state.producers.iter().all(|p| *p == ProducerState::Drained) {
            state.resolved = true;
            let buckets = std::mem::take(&mut state.buckets);
            drop(state);
            let outcome = self.merge(buckets);
            self.resolve(outcome);
        }
        Ok(Paging::Done)
    }

    /// Mark `producer` failed and fail the group with `cause`.
    pub fn fail(&self, producer: usize, cause: FanoutError) {
        let state = self.lock_state();
        self.fail_locked(state, Some(producer), cause);
    }

    /// Fail the group on behalf of a party that is not one of its producers.
    pub fn abort(&self, cause: FanoutError) {
        let state = self.lock_state();
        self.fail_locked(state, None, cause);
    }

    /// Resolve with an empty result; used when nothing will be supplied.
    pub fn finish(&self) {
        let mut state = self.lock_state();
        if state.resolved {
            return;
        }
        state.resolved = true;
        drop(state);
        let outcome = self.merge(Vec::new());
        self.resolve(outcome);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MergeState> {
        self.state.lock().expect("merge stage lock poisoned")
    }

    fn charge(&self, bucket: &Bucket) -> Result<()> {
        match self
            .accounting
            .lock()
            .expect("merge accounting lock poisoned")
            .as_ref()
        {
            Some(acc) => acc.add_bytes(bucket.memory_size()),
            None => Ok(()),
        }
    }

    fn fail_locked(
        &self,
        mut state: std::sync::MutexGuard<'_, MergeState>,
        producer: Option<usize>,
        cause: FanoutError,
    ) -> FanoutError {
        if let Some(p) = producer.and_then(|p| state.producers.get_mut(p)) {
            *p = ProducerState::Failed;
        }
        if state.resolved {
            return cause;
        }
        state.resolved = true;
        state.buckets.clear();
        drop(state);
        self.resolve(Err(cause.clone()));
        cause
    }

    fn resolve(&self, outcome: Result<TaskResult>) {
        let metrics = global_metrics();
        match &outcome {
            Ok(result) => {
                metrics.record_group_outcome(LOCAL_MERGE_OPERATION, "success");
                metrics.record_merged_rows(LOCAL_MERGE_OPERATION, result.num_rows() as u64);
            }
            Err(err) => metrics.record_group_outcome(LOCAL_MERGE_OPERATION, err.kind()),
        }
        if self.writer.set(outcome) {
            metrics.operation_finished(LOCAL_MERGE_OPERATION);
        }
        // releases the reserved bytes
        self.accounting
            .lock()
            .expect("merge accounting lock poisoned")
            .take();
    }

    fn merge(&self, buckets: Vec<Vec<Bucket>>) -> Result<TaskResult> {
        let schema = self.streamers.schema();
        let batches = buckets
            .into_iter()
            .flatten()
            .flat_map(Bucket::into_batches)
            .collect::<Vec<_>>();
        let mut merged = Bucket::empty(schema.clone());
        if batches.iter().any(|b| b.num_rows() > 0) {
            let batch = concat_batches(&schema, &batches)
                .map_err(|e| FanoutError::Execution(format!("merge concat failed: {e}")))?;
            let batch = if self.spec.order_by.is_empty() {
                batch
            } else {
                let columns = self
                    .spec
                    .order_by
                    .iter()
                    .map(|key| {
                        if key.column >= batch.num_columns() {
                            return Err(FanoutError::Execution(format!(
                                "sort column {} out of range",
                                key.column
                            )));
                        }
                        Ok(SortColumn {
                            values: batch.column(key.column).clone(),
                            options: Some(SortOptions {
                                descending: key.descending,
                                nulls_first: key.nulls_first,
                            }),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let indices = lexsort_to_indices(&columns, None)
                    .map_err(|e| FanoutError::Execution(format!("merge sort failed: {e}")))?;
                take_record_batch(&batch, &indices)
                    .map_err(|e| FanoutError::Execution(format!("merge sort failed: {e}")))?
            };
            merged = Bucket::new(schema, vec![batch]);
        }
        let merged = slice_rows(merged, self.spec.offset, self.spec.limit);
        let merged = ProjectorChain::new(&self.spec.projections).apply(merged)?;

        match self.result_kind {
            ResultKind::Rows => Ok(TaskResult::Rows {
                schema: merged.schema(),
                batches: merged.into_batches(),
            }),
            ResultKind::RowCount => sum_row_counts(&merged).map(TaskResult::RowCount),
        }
    }
}

fn sum_row_counts(bucket: &Bucket) -> Result<i64> {
    let mut total = 0i64;
    for batch in bucket.batches() {
        if batch.num_columns() == 0 {
            continue;
        }
        let counts = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| {
                FanoutError::Execution("row count result expects an Int64 column".to_string())
            })?;
        for count in counts.iter().flatten() {
            total = total.checked_add(count).ok_or_else(|| {
                FanoutError::Execution("row count overflows a 64-bit total".to_string())
            })?;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use fanout_common::{CircuitBreaker, UnitId};
    use fanout_planner::SortKey;

    use crate::slots::{ResultSlot, result_slot};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]))
    }

    fn bucket(values: &[i64]) -> Bucket {
        let batch =
            RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(values.to_vec()))])
                .unwrap();
        Bucket::new(schema(), vec![batch])
    }

    fn stage(spec: MergeSpec, producers: usize, kind: ResultKind) -> (Arc<MergeStage>, ResultSlot) {
        let (writer, slot) = result_slot(0);
        let breaker = CircuitBreaker::unlimited("test");
        let acc = breaker.context_for(UnitId(100), LOCAL_MERGE_OPERATION);
        let stage = MergeStage::new(JobId::new(), 0, &spec, producers, kind, acc, writer);
        (stage, slot)
    }

    fn values(result: &TaskResult) -> Vec<i64> {
        result
            .batches()
            .iter()
            .flat_map(|b| {
                let col = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
            })
            .collect()
    }

    fn spec() -> MergeSpec {
        MergeSpec::new(100, Schema::new(vec![Field::new("v", DataType::Int64, true)]))
    }

    #[tokio::test]
    async fn concatenates_in_producer_order() {
        let (stage, slot) = stage(spec(), 2, ResultKind::Rows);
        assert_eq!(stage.supply(1, bucket(&[3, 4]), true).unwrap(), Paging::Done);
        assert!(!slot.is_resolved());
        assert_eq!(stage.supply(0, bucket(&[1]), false).unwrap(), Paging::NeedMore);
        assert_eq!(stage.supply(0, bucket(&[2]), true).unwrap(), Paging::Done);
        assert_eq!(values(&slot.await.unwrap()), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn orders_and_limits() {
        let spec = spec()
            .with_order_by(vec![SortKey::desc(0)])
            .with_limit(2, 1);
        let (stage, slot) = stage(spec, 2, ResultKind::Rows);
        stage.supply(0, bucket(&[5, 1]), true).unwrap();
        stage.supply(1, bucket(&[9, 3]), true).unwrap();
        assert_eq!(values(&slot.await.unwrap()), vec![5, 3]);
    }

    #[tokio::test]
    async fn row_count_sums_first_column() {
        let (stage, slot) = stage(spec(), 2, ResultKind::RowCount);
        stage.supply(0, bucket(&[4]), true).unwrap();
        stage.supply(1, bucket(&[6]), true).unwrap();
        assert_eq!(slot.await.unwrap().row_count(), Some(10));
    }

    #[tokio::test]
    async fn row_count_overflow_fails_group() {
        let (stage, slot) = stage(spec(), 2, ResultKind::RowCount);
        stage.supply(0, bucket(&[i64::MAX]), true).unwrap();
        stage.supply(1, bucket(&[1]), true).unwrap();
        let err = slot.await.unwrap_err();
        assert!(matches!(err, FanoutError::Execution(_)));
        assert!(err.to_string().contains("overflow"));
    }

    #[tokio::test]
    async fn out_of_range_producer_fails_group() {
        let (stage, slot) = stage(spec(), 1, ResultKind::Rows);
        let err = stage.supply(3, bucket(&[1]), true).unwrap_err();
        assert!(matches!(err, FanoutError::ProtocolViolation(_)));
        assert!(matches!(slot.await, Err(FanoutError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn delivery_after_last_is_protocol_violation() {
        let (stage, slot) = stage(spec(), 2, ResultKind::Rows);
        stage.supply(0, bucket(&[1]), true).unwrap();
        assert!(stage.supply(0, bucket(&[2]), true).is_err());
        assert!(matches!(slot.await, Err(FanoutError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn first_failure_wins_and_stops_producers() {
        let (stage, slot) = stage(spec(), 2, ResultKind::Rows);
        stage.fail(0, FanoutError::remote_unavailable("n1", "down"));
        stage.abort(FanoutError::Execution("later".to_string()));
        assert_eq!(stage.supply(1, bucket(&[1]), true).unwrap(), Paging::Done);
        assert!(matches!(slot.await, Err(FanoutError::RemoteUnavailable { .. })));
    }

    #[tokio::test]
    async fn finish_resolves_empty() {
        let (stage, slot) = stage(spec(), 0, ResultKind::Rows);
        stage.finish();
        let result = slot.await.unwrap();
        assert_eq!(result.num_rows(), 0);
    }

    #[tokio::test]
    async fn circuit_breaker_fails_group_and_releases() {
        let (writer, slot) = result_slot(0);
        let breaker = CircuitBreaker::new("tiny", 16);
        let acc = breaker.context_for(UnitId(100), LOCAL_MERGE_OPERATION);
        let stage = MergeStage::new(JobId::new(), 0, &spec(), 1, ResultKind::Rows, acc, writer);
        let err = stage.supply(0, bucket(&[1, 2, 3, 4, 5, 6, 7, 8]), true).unwrap_err();
        assert!(matches!(err, FanoutError::CircuitBreaking { .. }));
        assert!(matches!(slot.await, Err(FanoutError::CircuitBreaking { .. })));
        assert_eq!(breaker.used_bytes(), 0);
    }
}
