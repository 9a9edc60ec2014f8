//! Flat projector chain applied to collected and merged rows.

use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use fanout_common::{FanoutError, Result};
use fanout_planner::Projection;

use crate::Bucket;

/// Applies a list of [`Projection`]s in order.
#[derive(Debug, Clone, Default)]
pub struct ProjectorChain {
    projections: Vec<Projection>,
}

impl ProjectorChain {
    pub fn new(projections: &[Projection]) -> Self {
        Self {
            projections: projections.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    pub fn apply(&self, mut bucket: Bucket) -> Result<Bucket> {
        for projection in &self.projections {
            bucket = match projection {
                Projection::Columns(indices) => project_columns(bucket, indices)?,
                Projection::Limit { limit, offset } => slice_rows(bucket, *offset, Some(*limit)),
                Projection::CountRows => count_rows(&bucket)?,
            };
        }
        Ok(bucket)
    }
}

fn project_columns(bucket: Bucket, indices: &[usize]) -> Result<Bucket> {
    let schema = bucket
        .schema()
        .project(indices)
        .map_err(|e| FanoutError::Execution(format!("column projection failed: {e}")))?;
    let batches = bucket
        .batches()
        .iter()
        .map(|b| b.project(indices))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FanoutError::Execution(format!("column projection failed: {e}")))?;
    Ok(Bucket::new(Arc::new(schema), batches))
}

/// Skip `offset` rows across batch boundaries, then keep at most `limit`.
pub fn slice_rows(bucket: Bucket, offset: usize, limit: Option<usize>) -> Bucket {
    if offset == 0 && limit.is_none() {
        return bucket;
    }
    let schema = bucket.schema();
    let mut to_skip = offset;
    let mut remaining = limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    for batch in bucket.into_batches() {
        if remaining == 0 {
            break;
        }
        let rows = batch.num_rows();
        if to_skip >= rows {
            to_skip -= rows;
            continue;
        }
        let take = (rows - to_skip).min(remaining);
        out.push(batch.slice(to_skip, take));
        remaining -= take;
        to_skip = 0;
    }
    Bucket::new(schema, out)
}

fn count_rows(bucket: &Bucket) -> Result<Bucket> {
    let schema = Arc::new(Schema::new(vec![Field::new(
        "count",
        DataType::Int64,
        false,
    )]));
    let count = i64::try_from(bucket.num_rows())
        .map_err(|e| FanoutError::Execution(format!("row count overflow: {e}")))?;
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![count]))])
        .map_err(|e| FanoutError::Execution(format!("count batch build failed: {e}")))?;
    Ok(Bucket::new(schema, vec![batch]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, StringArray};

    fn bucket() -> Bucket {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let b1 = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap();
        let b2 = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![3, 4, 5])),
                Arc::new(StringArray::from(vec!["c", "d", "e"])),
            ],
        )
        .unwrap();
        Bucket::new(schema, vec![b1, b2])
    }

    fn ids(bucket: &Bucket) -> Vec<i64> {
        bucket
            .batches()
            .iter()
            .flat_map(|b| {
                let col = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn limit_offset_spans_batches() {
        let out = ProjectorChain::new(&[Projection::Limit {
            limit: 2,
            offset: 1,
        }])
        .apply(bucket())
        .unwrap();
        assert_eq!(ids(&out), vec![2, 3]);
    }

    #[test]
    fn columns_then_count() {
        let out = ProjectorChain::new(&[Projection::Columns(vec![1]), Projection::CountRows])
            .apply(bucket())
            .unwrap();
        assert_eq!(out.schema().field(0).name(), "count");
        assert_eq!(ids(&out), vec![5]);
    }

    #[test]
    fn out_of_range_column_is_an_error() {
        let err = ProjectorChain::new(&[Projection::Columns(vec![7])])
            .apply(bucket())
            .unwrap_err();
        assert!(matches!(err, FanoutError::Execution(_)));
    }
}
