pub mod projections;
pub mod streams;
pub mod subscribe;

use evstore_client::{Connection, ResolvedEvent};
use evstore_core::ConnectionSettings;

/// Open a connection and wait for the handshake.
pub async fn connect(settings: ConnectionSettings) -> anyhow::Result<Connection> {
    let conn = Connection::from_settings(settings)?;
    conn.connect().await?;
    Ok(conn)
}

/// One line per event: `stream@number type body`.
pub fn format_event(event: &ResolvedEvent) -> String {
    let Some(recorded) = event.original_event() else {
        return "<unresolved link>".to_string();
    };
    let body = if recorded.is_json {
        String::from_utf8_lossy(&recorded.data).into_owned()
    } else {
        format!("<{} bytes>", recorded.data.len())
    };
    format!(
        "{}@{} {} {}",
        recorded.stream_id, recorded.event_number, recorded.event_type, body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstore_core::RecordedEvent;

    fn recorded(is_json: bool, data: &'static [u8]) -> ResolvedEvent {
        ResolvedEvent {
            event: Some(RecordedEvent {
                stream_id: "orders-1".into(),
                event_number: 4,
                event_id: Default::default(),
                event_type: "OrderPlaced".into(),
                is_json,
                data: data.into(),
                metadata: Default::default(),
                created_epoch: None,
            }),
            link: None,
            original_position: None,
        }
    }

    #[test]
    fn json_bodies_are_printed() {
        assert_eq!(format_event(&recorded(true, b"{\"id\":1}")), "orders-1@4 OrderPlaced {\"id\":1}");
    }

    #[test]
    fn binary_bodies_are_summarised() {
        assert_eq!(format_event(&recorded(false, &[0, 1, 2])), "orders-1@4 OrderPlaced <3 bytes>");
    }
}
