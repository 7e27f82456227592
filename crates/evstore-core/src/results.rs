//! Typed outcomes of stream operations.
//!
//! Expected domain outcomes such as a failed concurrency check are
//! variants here, not errors.

use crate::event::ResolvedEvent;
use crate::position::Position;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Success {
        next_expected_version: i64,
        log_position: Position,
    },
    WrongExpectedVersion {
        current_version: Option<i64>,
        message: Option<String>,
    },
    StreamDeleted,
    InvalidTransaction,
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteResult::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
    Success { log_position: Position },
    WrongExpectedVersion { message: Option<String> },
    StreamDeleted,
    InvalidTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub read_direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsSlice {
    pub read_direction: ReadDirection,
    pub from_position: Position,
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
}

impl AllEventsSlice {
    pub fn is_end_of_stream(&self) -> bool {
        self.events.is_empty()
    }
}
