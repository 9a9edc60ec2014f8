//! Arrow IPC stream codec for buckets crossing the wire.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fanout_common::{FanoutError, Result};

/// Encode a bucket as one Arrow IPC stream payload.
pub fn encode_bucket(bucket: &crate::Bucket) -> Result<Vec<u8>> {
    let schema = bucket.schema();
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| FanoutError::Execution(format!("ipc writer init failed: {e}")))?;
        for batch in bucket.batches() {
            writer
                .write(batch)
                .map_err(|e| FanoutError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| FanoutError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decoders for the row type of one merge spec.
///
/// Every bucket decoded through a `Streamers` must carry exactly the
/// expected columns; anything else is a protocol violation.
#[derive(Debug, Clone)]
pub struct Streamers {
    schema: SchemaRef,
}

impl Streamers {
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn decode(&self, payload: &[u8]) -> Result<crate::Bucket> {
        let reader = StreamReader::try_new(Cursor::new(payload), None)
            .map_err(|e| FanoutError::ProtocolViolation(format!("undecodable bucket: {e}")))?;
        if reader.schema().fields() != self.schema.fields() {
            return Err(FanoutError::ProtocolViolation(format!(
                "bucket schema {:?} does not match expected {:?}",
                reader.schema().fields(),
                self.schema.fields()
            )));
        }
        let batches = reader
            .collect::<std::result::Result<Vec<RecordBatch>, _>>()
            .map_err(|e| FanoutError::ProtocolViolation(format!("undecodable bucket: {e}")))?;
        Ok(crate::Bucket::new(self.schema.clone(), batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    use crate::Bucket;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    #[test]
    fn decodes_what_was_encoded() {
        let batch =
            RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(vec![7, 8]))]).unwrap();
        let payload = encode_bucket(&Bucket::new(schema(), vec![batch])).unwrap();
        let decoded = Streamers::new(schema()).decode(&payload).unwrap();
        assert_eq!(decoded.num_rows(), 2);
    }

    #[test]
    fn schema_mismatch_is_protocol_violation() {
        let other = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        let batch =
            RecordBatch::try_new(other.clone(), vec![Arc::new(StringArray::from(vec!["x"]))])
                .unwrap();
        let payload = encode_bucket(&Bucket::new(other, vec![batch])).unwrap();
        let err = Streamers::new(schema()).decode(&payload).unwrap_err();
        assert!(matches!(err, FanoutError::ProtocolViolation(_)));
    }

    #[test]
    fn garbage_is_protocol_violation() {
        let err = Streamers::new(schema()).decode(b"not arrow").unwrap_err();
        assert!(matches!(err, FanoutError::ProtocolViolation(_)));
    }
}
