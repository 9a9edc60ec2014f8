//! Row buckets: the unit of transfer between producers and merge stages.

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;

/// A batch-of-rows payload plus the schema it was produced with.
///
/// The schema travels with the bucket so empty buckets stay typed.
#[derive(Debug, Clone)]
pub struct Bucket {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Bucket {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(schema, Vec::new())
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Bytes charged against the accounting context for this bucket.
    pub fn memory_size(&self) -> usize {
        self.batches
            .iter()
            .map(RecordBatch::get_array_memory_size)
            .sum()
    }

    /// Split into pages of at most `page_size_rows` rows each.
    ///
    /// Always yields at least one page so a producer with no rows still
    /// sends its final delivery.
    pub fn into_pages(self, page_size_rows: usize) -> Vec<Bucket> {
        let page_size_rows = page_size_rows.max(1);
        let mut pages = Vec::new();
        let mut current = Vec::new();
        let mut current_rows = 0usize;
        for batch in self.batches {
            let mut offset = 0usize;
            while offset < batch.num_rows() {
                let take = (page_size_rows - current_rows).min(batch.num_rows() - offset);
                current.push(batch.slice(offset, take));
                current_rows += take;
                offset += take;
                if current_rows == page_size_rows {
                    pages.push(Bucket::new(self.schema.clone(), std::mem::take(&mut current)));
                    current_rows = 0;
                }
            }
        }
        if !current.is_empty() || pages.is_empty() {
            pages.push(Bucket::new(self.schema.clone(), current));
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    fn bucket(chunks: &[&[i64]]) -> Bucket {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batches = chunks
            .iter()
            .map(|c| {
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(c.to_vec()))])
                    .unwrap()
            })
            .collect();
        Bucket::new(schema, batches)
    }

    #[test]
    fn pages_cross_batch_boundaries() {
        let pages = bucket(&[&[1, 2, 3], &[4, 5]]).into_pages(2);
        let sizes = pages.iter().map(Bucket::num_rows).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn empty_bucket_still_yields_one_page() {
        let pages = bucket(&[]).into_pages(8);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_empty());
    }
}
