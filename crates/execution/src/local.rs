//! Local collect execution contract.

use fanout_common::{AccountingContext, FanoutError, JobId, Result, UnitId};
use fanout_planner::CollectUnit;
use futures::future::BoxFuture;
use tracing::trace;

use crate::{Bucket, ProjectorChain};

/// Source of rows for collect units on one node.
///
/// Implementations charge what they materialize against `accounting` so a
/// tripped circuit breaker surfaces as `CircuitBreaking`.
pub trait LocalExecutor: Send + Sync {
    fn scan<'a>(
        &'a self,
        job_id: JobId,
        unit: &'a CollectUnit,
        accounting: &'a AccountingContext,
    ) -> BoxFuture<'a, Result<Bucket>>;
}

/// Scan `unit` and run its projector chain, returning one bucket.
///
/// Failures other than accounting are reported as `LocalExecution`.
pub async fn run_collect(
    executor: &dyn LocalExecutor,
    job_id: JobId,
    unit_id: UnitId,
    unit: &CollectUnit,
    accounting: &AccountingContext,
) -> Result<Bucket> {
    let scanned = executor
        .scan(job_id, unit, accounting)
        .await
        .map_err(|e| local_failure(unit_id, e))?;
    let bucket = ProjectorChain::new(&unit.projections)
        .apply(scanned)
        .map_err(|e| local_failure(unit_id, e))?;
    trace!(
        job_id = %job_id,
        unit = %unit_id,
        table = %unit.table,
        rows = bucket.num_rows(),
        "collect finished"
    );
    Ok(bucket)
}

fn local_failure(unit_id: UnitId, err: FanoutError) -> FanoutError {
    match err {
        FanoutError::CircuitBreaking { .. } | FanoutError::LocalExecution(_) => err,
        other => FanoutError::LocalExecution(format!("collect unit {unit_id}: {other}")),
    }
}
