//! JSON documents returned by the administrative endpoints.
//!
//! Fields missing from a server response fall back to their defaults so
//! older and newer servers both decode.

use serde::{Deserialize, Serialize};

/// Status of one projection as reported by `/projection/{name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionDetails {
    pub core_processing_time: i64,
    pub version: i64,
    pub epoch: i64,
    pub effective_name: String,
    pub writes_in_progress: i32,
    pub reads_in_progress: i32,
    pub partitions_cached: i32,
    pub status: String,
    pub state_reason: Option<String>,
    pub name: String,
    pub mode: String,
    pub position: String,
    pub progress: f64,
    pub last_checkpoint: Option<String>,
    pub events_processed_after_restart: i64,
    pub status_url: String,
    pub state_url: String,
    pub result_url: String,
    pub query_url: String,
    pub enable_command_url: String,
    pub disable_command_url: String,
    pub checkpoint_status: Option<String>,
    pub buffered_events: i64,
    pub write_pending_events_before_checkpoint: i32,
    pub write_pending_events_after_checkpoint: i32,
}

/// Body of `/projection/{name}/statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionStatistics {
    pub projections: Vec<ProjectionDetails>,
}

/// Body of the `/projections/{mode}` listings. The server sends `null`
/// instead of an empty array when nothing matches.
#[derive(Debug, Deserialize)]
pub(crate) struct ProjectionList {
    #[serde(default)]
    pub projections: Option<Vec<ProjectionDetails>>,
}

/// Summary of a persistent subscription group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentSubscriptionDetails {
    pub event_stream_id: String,
    pub group_name: String,
    pub status: String,
    pub average_items_per_second: f64,
    pub total_items_processed: i64,
    pub count_since_last_measurement: i64,
    pub last_processed_event_number: i64,
    pub last_known_event_number: i64,
    pub read_buffer_count: i64,
    pub live_buffer_count: i64,
    pub retry_buffer_count: i64,
    pub total_in_flight_messages: i64,
    pub connection_count: i64,
    pub parked_message_uri: String,
    pub get_messages_uri: String,
    pub config: Option<PersistentSubscriptionConfigDetails>,
    pub connections: Vec<PersistentSubscriptionConnectionDetails>,
}

/// Group configuration, only present in `describe` responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentSubscriptionConfigDetails {
    pub resolve_linktos: bool,
    pub start_from: i64,
    pub message_timeout_milliseconds: i64,
    pub extra_statistics: bool,
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub buffer_size: i32,
    pub read_batch_size: i32,
    pub check_point_after_milliseconds: i64,
    pub min_check_point_count: i32,
    pub max_check_point_count: i32,
    pub max_subscriber_count: i32,
    pub named_consumer_strategy: String,
}

/// One consumer attached to a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentSubscriptionConnectionDetails {
    pub from: String,
    pub username: String,
    pub average_items_per_second: f64,
    pub total_items_processed: i64,
    pub count_since_last_measurement: i64,
    pub available_slots: i64,
    pub in_flight_messages: i64,
}
