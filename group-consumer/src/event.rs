use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::kafka::types::Partition;

/// Application event carried in every record payload.
///
/// `data` is an opaque, usually JSON, document. On the wire it is a base64
/// string, so envelopes stay compatible with producers that encode raw
/// bytes as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    pub occurred_on: DateTime<Utc>,
}

impl EventEnvelope {
    /// A fresh envelope with a new id, stamped now, with no data attached.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type: event_type.to_owned(),
            data: Vec::new(),
            occurred_on: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Decode the attached data as JSON
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Serialize `value` as JSON and attach it as the event data
    pub fn set_json_data<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.data = serde_json::to_vec(value)?;
        Ok(())
    }

    /// Parse a record payload. A missing payload is an error: the record
    /// cannot carry an event.
    pub fn from_payload(payload: Option<&[u8]>) -> Result<Self, DecodeError> {
        let payload = payload.ok_or(DecodeError::EmptyPayload)?;
        Ok(serde_json::from_slice(payload)?)
    }
}

/// What a handler receives for each successfully decoded record.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: String,
    pub value: EventEnvelope,
    pub partition: Partition,
    pub offset: i64,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    // null is accepted as empty data
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
