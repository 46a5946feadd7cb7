//! WAL change decoding seam.
//!
//! Translating a replication stream's wire format (the output of a
//! logical decoding plugin) into the change events this service batches
//! and publishes is explicitly out of scope (§5 Non-goals): production
//! deployments plug in their own decoder for whatever output plugin the
//! publication uses (`wal2json`, `pgoutput`, etc). This module only
//! defines the seam and a minimal passthrough used by tests and by
//! deployments that already emit JSON on the wire.

use bytes::Bytes;

use crate::lsn::Lsn;

/// One decoded change event, ready to register with the ack tracker and
/// hand to the sink. `partition_key` defaults to the table identity if a
/// decoder can extract one; callers that don't care may use the LSN.
pub struct DecodedEvent {
    pub lsn: Lsn,
    pub partition_key: String,
    pub payload: Bytes,
}

/// Decodes raw WAL data (the body of an `XLogData` message) into zero or
/// more change events. A single WAL record can decode to zero events
/// (e.g. a BEGIN/COMMIT marker with no row changes under some output
/// plugins) or more than one (an UPDATE touching a partitioned table).
pub trait WalEventDecoder: Send {
    fn decode(&mut self, lsn: Lsn, wal_data: &[u8]) -> anyhow::Result<Vec<DecodedEvent>>;
}

/// Treats the WAL payload as a pre-formed JSON document and forwards it
/// unchanged, keyed by LSN. Useful for deployments that already run a
/// logical decoding plugin producing JSON, and for exercising the rest of
/// the pipeline in tests without a real decoder.
#[derive(Default)]
pub struct JsonPassthroughDecoder;

impl WalEventDecoder for JsonPassthroughDecoder {
    fn decode(&mut self, lsn: Lsn, wal_data: &[u8]) -> anyhow::Result<Vec<DecodedEvent>> {
        if wal_data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DecodedEvent {
            lsn,
            partition_key: lsn.to_string(),
            payload: Bytes::copy_from_slice(wal_data),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_forwards_payload_unchanged() {
        let mut decoder = JsonPassthroughDecoder;
        let events = decoder.decode(Lsn(42), br#"{"op":"insert"}"#).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lsn, Lsn(42));
        assert_eq!(&events[0].payload[..], br#"{"op":"insert"}"#);
    }

    #[test]
    fn empty_payload_decodes_to_no_events() {
        let mut decoder = JsonPassthroughDecoder;
        let events = decoder.decode(Lsn(1), b"").unwrap();
        assert!(events.is_empty());
    }
}
