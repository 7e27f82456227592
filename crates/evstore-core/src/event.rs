//! Event value types.

use bytes::Bytes;
use evstore_proto::messages;
use evstore_proto::{ProtoError, ProtoResult};
use serde::Serialize;
use uuid::Uuid;

use crate::position::Position;

const CONTENT_TYPE_BINARY: i32 = 0;
const CONTENT_TYPE_JSON: i32 = 1;

/// An event to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Used by the server for idempotent writes; keep it stable across retries.
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, is_json: bool, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// Serialize `body` as the JSON payload of a new event.
    pub fn json<T: Serialize>(event_type: impl Into<String>, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(event_type, true, serde_json::to_vec(body)?))
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn to_wire(&self) -> messages::NewEvent {
        let content_type = if self.is_json {
            CONTENT_TYPE_JSON
        } else {
            CONTENT_TYPE_BINARY
        };
        messages::NewEvent {
            event_id: self.event_id.to_bytes_le().to_vec(),
            event_type: self.event_type.clone(),
            data_content_type: content_type,
            metadata_content_type: content_type,
            data: self.data.to_vec(),
            metadata: Some(self.metadata.to_vec()),
        }
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    /// Milliseconds since the Unix epoch.
    pub created_epoch: Option<i64>,
}

impl RecordedEvent {
    /// Decode the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }
}

impl TryFrom<messages::EventRecord> for RecordedEvent {
    type Error = ProtoError;

    fn try_from(record: messages::EventRecord) -> ProtoResult<Self> {
        let event_id = Uuid::from_slice_le(&record.event_id).map_err(|_| {
            ProtoError::MalformedPackage(format!(
                "event id of {} bytes in stream {}",
                record.event_id.len(),
                record.event_stream_id
            ))
        })?;
        Ok(Self {
            stream_id: record.event_stream_id,
            event_number: record.event_number,
            event_id,
            event_type: record.event_type,
            is_json: record.data_content_type == CONTENT_TYPE_JSON,
            data: Bytes::from(record.data),
            metadata: record.metadata.map(Bytes::from).unwrap_or_default(),
            created_epoch: record.created_epoch,
        })
    }
}

/// A read or pushed event, with the link that pointed at it when link
/// resolution was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub event: Option<RecordedEvent>,
    pub link: Option<RecordedEvent>,
    /// Only set for events read from or pushed on `$all`.
    pub original_position: Option<Position>,
}

impl ResolvedEvent {
    /// The record that was actually in the read stream: the link if there
    /// was one, otherwise the event.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }

    pub fn original_stream_id(&self) -> Option<&str> {
        self.original_event().map(|e| e.stream_id.as_str())
    }

    pub fn original_event_number(&self) -> Option<i64> {
        self.original_event().map(|e| e.event_number)
    }

    pub fn is_resolved(&self) -> bool {
        self.link.is_some() && self.event.is_some()
    }

    pub(crate) fn from_parts(
        event: Option<messages::EventRecord>,
        link: Option<messages::EventRecord>,
        original_position: Option<Position>,
    ) -> ProtoResult<Self> {
        Ok(Self {
            event: event.map(RecordedEvent::try_from).transpose()?,
            link: link.map(RecordedEvent::try_from).transpose()?,
            original_position,
        })
    }
}

impl TryFrom<messages::ResolvedIndexedEvent> for ResolvedEvent {
    type Error = ProtoError;

    fn try_from(value: messages::ResolvedIndexedEvent) -> ProtoResult<Self> {
        Self::from_parts(value.event, value.link, None)
    }
}

impl TryFrom<messages::ResolvedEvent> for ResolvedEvent {
    type Error = ProtoError;

    fn try_from(value: messages::ResolvedEvent) -> ProtoResult<Self> {
        let position = Position::new(value.commit_position, value.prepare_position);
        Self::from_parts(value.event, value.link, Some(position))
    }
}
