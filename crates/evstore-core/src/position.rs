//! Global positions, per-stream event numbers, and expected versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the global (`$all`) log.
///
/// Ordered by commit position, then prepare position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub commit_position: i64,
    pub prepare_position: i64,
}

impl Position {
    pub const START: Position = Position {
        commit_position: 0,
        prepare_position: 0,
    };

    pub const END: Position = Position {
        commit_position: -1,
        prepare_position: -1,
    };

    pub fn new(commit_position: i64, prepare_position: i64) -> Self {
        Self {
            commit_position,
            prepare_position,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit_position, self.prepare_position)
    }
}

/// Well-known per-stream event numbers.
pub struct StreamPosition;

impl StreamPosition {
    pub const START: i64 = 0;
    pub const END: i64 = -1;
}

/// Optimistic concurrency check applied to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The stream must not exist (or be empty).
    NoStream,
    /// The stream must exist.
    StreamExists,
    /// The last event number must equal this value.
    Exact(i64),
}

impl ExpectedVersion {
    pub const EMPTY_STREAM: ExpectedVersion = ExpectedVersion::NoStream;

    pub fn as_i64(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => -1,
            ExpectedVersion::StreamExists => -4,
            ExpectedVersion::Exact(v) => v,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            -2 => ExpectedVersion::Any,
            -1 => ExpectedVersion::NoStream,
            -4 => ExpectedVersion::StreamExists,
            n => ExpectedVersion::Exact(n),
        }
    }
}
