//! The publish sink abstraction and its Kinesis-backed implementation.
//!
//! Modeled on the `Sink` seam in `proxy::redis::publisher`: a small
//! `async_trait` so the publisher can be driven against a real AWS
//! endpoint in production and an in-memory double in tests, without the
//! publisher itself knowing which.

use async_trait::async_trait;
use bytes::Bytes;

/// One record submitted to the sink, keyed by the event it came from so
/// the publisher can map sink-reported outcomes back to ack ids.
pub struct PutRecord {
    pub ack_id: u64,
    pub partition_key: String,
    pub payload: Bytes,
}

/// Per-record outcome of a batch put, positionally aligned with the
/// input `Vec<PutRecord>`.
pub enum PutOutcome {
    Success,
    Failed {
        error_code: Option<String>,
        message: String,
    },
}

/// A batch-put sink. Implementations report one [`PutOutcome`] per input
/// record, in the same order, even on partial failure: Kinesis's
/// `PutRecords` never fails the whole batch for one bad record.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn put_records(&self, records: Vec<PutRecord>) -> anyhow::Result<Vec<PutOutcome>>;
}

/// Kinesis-backed sink. One `PutRecords` call per batch.
pub struct KinesisSink {
    client: aws_sdk_kinesis::Client,
    stream_name: String,
}

impl KinesisSink {
    pub fn new(client: aws_sdk_kinesis::Client, stream_name: String) -> Self {
        KinesisSink {
            client,
            stream_name,
        }
    }
}

#[async_trait]
impl Sink for KinesisSink {
    async fn put_records(&self, records: Vec<PutRecord>) -> anyhow::Result<Vec<PutOutcome>> {
        use aws_sdk_kinesis::types::PutRecordsRequestEntry;

        let entries: Vec<PutRecordsRequestEntry> = records
            .iter()
            .map(|r| {
                PutRecordsRequestEntry::builder()
                    .partition_key(r.partition_key.clone())
                    .data(r.payload.clone().into())
                    .build()
                    .expect("partition_key and data are always set")
            })
            .collect();

        let output = self
            .client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("PutRecords call failed: {e}"))?;

        let outcomes = output
            .records()
            .iter()
            .map(|entry| match entry.error_code() {
                None => PutOutcome::Success,
                Some(code) => PutOutcome::Failed {
                    error_code: Some(code.to_string()),
                    message: entry
                        .error_message()
                        .unwrap_or("no error message provided")
                        .to_string(),
                },
            })
            .collect();

        Ok(outcomes)
    }
}

/// In-memory sink double for tests: records every batch it receives and
/// returns a pre-programmed outcome sequence.
#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    pub enum Programmed {
        AllSucceed,
        AllFail { error_code: Option<String>, message: String },
        CallFails(String),
        PerRecord(Vec<PutOutcome>),
    }

    #[derive(Default)]
    pub struct FakeSink {
        programs: Mutex<Vec<Programmed>>,
        pub received: Mutex<Vec<Vec<PutRecord>>>,
    }

    impl FakeSink {
        pub fn new() -> Self {
            FakeSink::default()
        }

        /// Queue the outcome for the next `put_records` call. Calls beyond
        /// the programmed sequence default to success.
        pub fn program(&self, outcome: Programmed) {
            self.programs.lock().push(outcome);
        }
    }

    #[async_trait]
    impl Sink for FakeSink {
        async fn put_records(&self, records: Vec<PutRecord>) -> anyhow::Result<Vec<PutOutcome>> {
            let n = records.len();
            let program = if self.programs.lock().is_empty() {
                None
            } else {
                Some(self.programs.lock().remove(0))
            };
            self.received.lock().push(
                records
                    .iter()
                    .map(|r| PutRecord {
                        ack_id: r.ack_id,
                        partition_key: r.partition_key.clone(),
                        payload: r.payload.clone(),
                    })
                    .collect(),
            );

            match program {
                None | Some(Programmed::AllSucceed) => {
                    Ok((0..n).map(|_| PutOutcome::Success).collect())
                }
                Some(Programmed::AllFail { error_code, message }) => Ok((0..n)
                    .map(|_| PutOutcome::Failed {
                        error_code: error_code.clone(),
                        message: message.clone(),
                    })
                    .collect()),
                Some(Programmed::CallFails(msg)) => Err(anyhow::anyhow!(msg)),
                Some(Programmed::PerRecord(outcomes)) => Ok(outcomes),
            }
        }
    }
}
