use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::RwLock;

use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fanout_common::{AccountingContext, FanoutError, JobId, Result};
use fanout_planner::CollectUnit;
use futures::future::BoxFuture;

use crate::{Bucket, LocalExecutor};

/// Reference executor serving named in-memory Arrow tables.
#[derive(Default)]
pub struct InMemoryExecutor {
    tables: RwLock<HashMap<String, Bucket>>,
}

impl std::fmt::Debug for InMemoryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.tables.read().map(|t| t.len()).unwrap_or_default();
        f.debug_struct("InMemoryExecutor")
            .field("tables", &count)
            .finish()
    }
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a table.
    pub fn register_table(
        &self,
        name: impl Into<String>,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) {
        self.tables
            .write()
            .expect("table registry lock poisoned")
            .insert(name.into(), Bucket::new(schema, batches));
    }

    /// Load an Arrow IPC file as table `name`.
    pub fn load_ipc_file(&self, name: impl Into<String>, path: &Path) -> Result<usize> {
        let file = File::open(path).map_err(|e| {
            FanoutError::InvalidConfig(format!("cannot open {}: {e}", path.display()))
        })?;
        let reader = FileReader::try_new(file, None)
            .map_err(|e| FanoutError::Execution(format!("ipc file read failed: {e}")))?;
        let schema = reader.schema();
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FanoutError::Execution(format!("ipc file read failed: {e}")))?;
        let rows = batches.iter().map(RecordBatch::num_rows).sum();
        self.register_table(name, schema, batches);
        Ok(rows)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names = self
            .tables
            .read()
            .expect("table registry lock poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl LocalExecutor for InMemoryExecutor {
    fn scan<'a>(
        &'a self,
        _job_id: JobId,
        unit: &'a CollectUnit,
        accounting: &'a AccountingContext,
    ) -> BoxFuture<'a, Result<Bucket>> {
        Box::pin(async move {
            let bucket = self
                .tables
                .read()
                .expect("table registry lock poisoned")
                .get(&unit.table)
                .cloned()
                .ok_or_else(|| {
                    FanoutError::LocalExecution(format!("unknown table '{}'", unit.table))
                })?;
            accounting.add_bytes(bucket.memory_size())?;
            Ok(bucket)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use fanout_common::{CircuitBreaker, UnitId};
    use fanout_planner::{ExecutionUnit, Projection};

    use crate::run_collect;

    fn executor() -> InMemoryExecutor {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3, 4]))],
        )
        .unwrap();
        let exec = InMemoryExecutor::new();
        exec.register_table("t", schema, vec![batch]);
        exec
    }

    #[tokio::test]
    async fn run_collect_applies_projections() {
        let exec = executor();
        let unit = ExecutionUnit::collect(1, vec![], "t").with_projections(vec![
            Projection::Limit {
                limit: 3,
                offset: 0,
            },
            Projection::CountRows,
        ]);
        let breaker = CircuitBreaker::unlimited("test");
        let acc = breaker.context_for(UnitId(1), "collect");
        let out = run_collect(&exec, JobId::new(), unit.id, unit.as_collect().unwrap(), &acc)
            .await
            .unwrap();
        let col = out.batches()[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.value(0), 3);
        assert!(acc.reserved_bytes() > 0);
    }

    #[tokio::test]
    async fn unknown_table_is_local_execution_failure() {
        let exec = executor();
        let unit = ExecutionUnit::collect(1, vec![], "missing");
        let breaker = CircuitBreaker::unlimited("test");
        let acc = breaker.context_for(UnitId(1), "collect");
        let err = run_collect(&exec, JobId::new(), unit.id, unit.as_collect().unwrap(), &acc)
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::LocalExecution(_)));
    }

    #[tokio::test]
    async fn tiny_breaker_trips() {
        let exec = executor();
        let unit = ExecutionUnit::collect(1, vec![], "t");
        let breaker = CircuitBreaker::new("tiny", 8);
        let acc = breaker.context_for(UnitId(1), "collect");
        let err = run_collect(&exec, JobId::new(), unit.id, unit.as_collect().unwrap(), &acc)
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::CircuitBreaking { .. }));
        assert_eq!(exec.table_names(), vec!["t".to_string()]);
    }
}
