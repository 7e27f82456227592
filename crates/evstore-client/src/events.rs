//! Connection lifecycle notifications.

use evstore_core::EndPoint;

/// Broadcast to every receiver obtained from `Connection::events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed; operations flow to `endpoint`.
    Connected { endpoint: EndPoint },
    /// The transport to `endpoint` was lost.
    Disconnected { endpoint: EndPoint },
    /// A new connection attempt was scheduled.
    Reconnecting { attempt: u32 },
    /// Terminal. No further events follow.
    Closed { reason: String },
    /// The server rejected the default credentials, or never answered.
    /// The connection proceeds unauthenticated.
    AuthenticationFailed { reason: String },
    /// A recoverable failure, such as a refused connection attempt.
    ErrorOccurred { message: String },
}

/// Capacity of the lifecycle broadcast channel. Slow receivers lag rather
/// than block the engine.
pub(crate) const EVENT_CAPACITY: usize = 64;
