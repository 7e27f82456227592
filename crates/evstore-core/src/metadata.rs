//! Stream metadata, stored as JSON in the `$$<stream>` metastream.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Name of the metastream holding `stream`'s metadata.
pub fn metastream_of(stream: &str) -> String {
    format!("$${stream}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    /// Seconds.
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
    /// Seconds.
    #[serde(rename = "$cacheControl", default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<u64>,
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,
    /// Application-defined keys.
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamAcl {
    #[serde(rename = "$r", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub read_roles: Vec<String>,
    #[serde(rename = "$w", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub write_roles: Vec<String>,
    #[serde(rename = "$d", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub delete_roles: Vec<String>,
    #[serde(rename = "$mr", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub meta_read_roles: Vec<String>,
    #[serde(rename = "$mw", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub meta_write_roles: Vec<String>,
}

/// ACL roles may be written as a single string or an array.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Roles {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Roles::deserialize(deserializer)? {
        Roles::One(role) => vec![role],
        Roles::Many(roles) => roles,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadataResult {
    pub stream: String,
    pub is_stream_deleted: bool,
    /// -1 when no metadata was ever written.
    pub metastream_version: i64,
    pub metadata: StreamMetadata,
}
