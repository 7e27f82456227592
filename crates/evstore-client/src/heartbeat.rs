//! Connection liveness tracking.
//!
//! Pure state machine driven by the engine's tick: any inbound package
//! proves the connection alive; after `interval` of silence a heartbeat request is
//! sent, and if nothing arrives within `timeout` of that request the
//! connection is declared dead.

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

/// What the engine should do after a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    Idle,
    /// Send a `HeartbeatRequest` with this correlation id.
    SendRequest(Uuid),
    /// No response to the outstanding request; treat as transport loss.
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_received: Instant,
    outstanding: Option<(Uuid, Instant)>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_received: now,
            outstanding: None,
        }
    }

    /// Record inbound traffic.
    pub(crate) fn on_package(&mut self, now: Instant) {
        self.last_received = now;
        self.outstanding = None;
    }

    pub(crate) fn check(&mut self, now: Instant) -> HeartbeatAction {
        if let Some((id, sent_at)) = self.outstanding {
            if now.saturating_duration_since(sent_at) >= self.timeout {
                warn!(
                    request = %id,
                    silent_for = ?now.saturating_duration_since(self.last_received),
                    "heartbeat timed out"
                );
                return HeartbeatAction::TimedOut;
            }
            return HeartbeatAction::Idle;
        }

        if now.saturating_duration_since(self.last_received) >= self.interval {
            let id = Uuid::new_v4();
            debug!(request = %id, "sending heartbeat request");
            self.outstanding = Some((id, now));
            return HeartbeatAction::SendRequest(id);
        }

        HeartbeatAction::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_millis(750), Duration::from_millis(1500), now)
    }

    #[test]
    fn idle_while_traffic_flows() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        assert_eq!(hb.check(t0 + Duration::from_millis(500)), HeartbeatAction::Idle);
        hb.on_package(t0 + Duration::from_millis(600));
        assert_eq!(hb.check(t0 + Duration::from_millis(1200)), HeartbeatAction::Idle);
    }

    #[test]
    fn requests_after_interval_of_silence() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        let action = hb.check(t0 + Duration::from_millis(800));
        assert!(matches!(action, HeartbeatAction::SendRequest(_)));
        // Only one request outstanding at a time.
        assert_eq!(hb.check(t0 + Duration::from_millis(900)), HeartbeatAction::Idle);
    }

    #[test]
    fn response_clears_outstanding_request() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        hb.check(t0 + Duration::from_millis(800));
        hb.on_package(t0 + Duration::from_millis(1000));
        assert_eq!(hb.check(t0 + Duration::from_millis(1500)), HeartbeatAction::Idle);
        assert!(matches!(
            hb.check(t0 + Duration::from_millis(2400)),
            HeartbeatAction::SendRequest(_)
        ));
    }

    #[test]
    fn times_out_without_response() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        hb.check(t0 + Duration::from_millis(800));
        assert_eq!(hb.check(t0 + Duration::from_millis(2000)), HeartbeatAction::Idle);
        assert_eq!(hb.check(t0 + Duration::from_millis(2300)), HeartbeatAction::TimedOut);
    }
}
