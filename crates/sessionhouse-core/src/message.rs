//! Inbound Message Types
//!
//! This module defines the two shapes a message takes on its way into the
//! ingester:
//!
//! - **`LogMessage`**: the raw unit delivered by the log client. Carries its
//!   position (`topic`, `partition`, `offset`), the broker timestamp, and the
//!   undecoded payload bytes.
//! - **`RecordingPayload`**: the decoded body - which team the recording
//!   belongs to, which session it extends, and the captured event records.
//!
//! ## Structure
//!
//! Within a partition, `offset` is strictly monotonic; the ingester relies on
//! this to keep session buffers ordered and to compute safe commit points.
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for the payload so routing a message into a buffer
//!   never copies it
//! - `size_bytes` is carried separately from `payload.len()` because the log
//!   client reports the on-wire size (key + headers + body), which is what
//!   the overflow detector meters
//! - Event records stay as `serde_json::Value` - the ingester treats them as
//!   opaque lines to be re-emitted as JSONL

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single message delivered from the partitioned log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Topic the message was consumed from.
    pub topic: String,

    /// Partition within the topic.
    pub partition: i32,

    /// Offset of this message in the partition. Strictly monotonic per
    /// partition.
    pub offset: u64,

    /// Broker timestamp in milliseconds since epoch.
    pub timestamp: i64,

    /// Optional routing key.
    pub key: Option<Bytes>,

    /// On-wire size of the message as reported by the log client.
    pub size_bytes: usize,

    /// Undecoded payload.
    pub payload: Bytes,
}

impl LogMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: u64,
        timestamp: i64,
        payload: Bytes,
    ) -> Self {
        let size_bytes = payload.len();
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            key: None,
            size_bytes,
            payload,
        }
    }

    /// Override the reported on-wire size (the payload length by default).
    pub fn with_size(mut self, size_bytes: usize) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }
}

/// The decoded body of a session-recording message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingPayload {
    /// Opaque token identifying the team that produced the recording.
    pub team_token: String,

    /// Session the events belong to.
    pub session_id: String,

    /// Captured event records, kept opaque.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

impl RecordingPayload {
    /// Decode a message payload.
    ///
    /// Fails with [`Error::Decode`] on malformed JSON and
    /// [`Error::EmptyPayload`] on a zero-length body.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        Ok(serde_json::from_slice(payload)?)
    }

    /// Render the event records as newline-delimited JSON, the body format
    /// of a session buffer.
    pub fn to_jsonl(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for event in &self.events {
            serde_json::to_writer(&mut out, event)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_json(token: &str, session: &str) -> Bytes {
        Bytes::from(format!(
            r#"{{"team_token":"{token}","session_id":"{session}","events":[{{"t":1}},{{"t":2}}]}}"#
        ))
    }

    // ---------------------------------------------------------------
    // LogMessage construction
    // ---------------------------------------------------------------

    #[test]
    fn test_message_size_defaults_to_payload_len() {
        let msg = LogMessage::new("events", 0, 7, 1000, Bytes::from("abcde"));
        assert_eq!(msg.size_bytes, 5);
        assert!(msg.key.is_none());
    }

    #[test]
    fn test_message_with_size_override() {
        let msg = LogMessage::new("events", 0, 7, 1000, Bytes::from("abcde")).with_size(512);
        assert_eq!(msg.size_bytes, 512);
    }

    #[test]
    fn test_message_with_key() {
        let msg = LogMessage::new("events", 3, 1, 0, Bytes::new()).with_key(Bytes::from("sid"));
        assert_eq!(msg.key, Some(Bytes::from("sid")));
    }

    // ---------------------------------------------------------------
    // Payload decoding
    // ---------------------------------------------------------------

    #[test]
    fn test_decode_valid_payload() {
        let decoded = RecordingPayload::decode(&payload_json("tok", "sid1")).unwrap();
        assert_eq!(decoded.team_token, "tok");
        assert_eq!(decoded.session_id, "sid1");
        assert_eq!(decoded.events.len(), 2);
    }

    #[test]
    fn test_decode_missing_events_defaults_empty() {
        let raw = Bytes::from(r#"{"team_token":"tok","session_id":"sid1"}"#);
        let decoded = RecordingPayload::decode(&raw).unwrap();
        assert!(decoded.events.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = RecordingPayload::decode(&Bytes::from("not json")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_empty() {
        let err = RecordingPayload::decode(&Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::EmptyPayload));
    }

    #[test]
    fn test_decode_rejects_missing_session() {
        let raw = Bytes::from(r#"{"team_token":"tok"}"#);
        assert!(RecordingPayload::decode(&raw).is_err());
    }

    // ---------------------------------------------------------------
    // JSONL rendering
    // ---------------------------------------------------------------

    #[test]
    fn test_to_jsonl_one_line_per_event() {
        let decoded = RecordingPayload::decode(&payload_json("tok", "sid1")).unwrap();
        let body = decoded.to_jsonl().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text, "{\"t\":1}\n{\"t\":2}\n");
    }

    #[test]
    fn test_to_jsonl_empty_events() {
        let payload = RecordingPayload {
            team_token: "tok".to_string(),
            session_id: "sid".to_string(),
            events: vec![],
        };
        assert!(payload.to_jsonl().unwrap().is_empty());
    }
}
