use anyhow::bail;
use evstore_client::{EventData, ExpectedVersion, Position};
use evstore_core::{ConnectionSettings, SliceReadStatus, WriteResult};

use super::{connect, format_event};

pub async fn append(
    settings: ConnectionSettings,
    stream: &str,
    event_type: &str,
    data: String,
    expected: &str,
    is_json: bool,
) -> anyhow::Result<()> {
    let expected = parse_expected_version(expected)?;
    if is_json {
        serde_json::from_str::<serde_json::Value>(&data)
            .map_err(|e| anyhow::anyhow!("event body is not valid JSON ({e}); pass --binary to send it raw"))?;
    }
    let event = EventData::new(event_type, is_json, data);
    let event_id = event.event_id;

    let conn = connect(settings).await?;
    let result = conn.append_to_stream(stream, expected, vec![event], None).await;
    conn.close().await;

    match result? {
        WriteResult::Success {
            next_expected_version,
            log_position,
        } => {
            println!("✓ {stream}@{next_expected_version} ({event_id}) at {log_position}");
            Ok(())
        }
        WriteResult::WrongExpectedVersion { current_version, .. } => match current_version {
            Some(current) => bail!("wrong expected version: stream is at {current}"),
            None => bail!("wrong expected version"),
        },
        WriteResult::StreamDeleted => bail!("stream {stream} has been deleted"),
        WriteResult::InvalidTransaction => bail!("invalid transaction"),
    }
}

pub async fn read(
    settings: ConnectionSettings,
    stream: &str,
    from: i64,
    count: i32,
    backward: bool,
    resolve_links: bool,
) -> anyhow::Result<()> {
    let conn = connect(settings).await?;
    let slice = if backward {
        conn.read_stream_events_backward(stream, from, count, resolve_links, None).await
    } else {
        conn.read_stream_events_forward(stream, from, count, resolve_links, None).await
    };
    conn.close().await;
    let slice = slice?;

    match slice.status {
        SliceReadStatus::Success => {}
        SliceReadStatus::StreamNotFound => bail!("stream {stream} not found"),
        SliceReadStatus::StreamDeleted => bail!("stream {stream} has been deleted"),
    }
    for event in &slice.events {
        println!("{}", format_event(event));
    }
    if !slice.is_end_of_stream {
        eprintln!("(more events from {})", slice.next_event_number);
    }
    Ok(())
}

pub async fn read_all(settings: ConnectionSettings, count: i32, backward: bool) -> anyhow::Result<()> {
    let conn = connect(settings).await?;
    let slice = if backward {
        conn.read_all_events_backward(Position::END, count, false, None).await
    } else {
        conn.read_all_events_forward(Position::START, count, false, None).await
    };
    conn.close().await;
    let slice = slice?;

    for event in &slice.events {
        match event.original_position {
            Some(position) => println!("{position} {}", format_event(event)),
            None => println!("{}", format_event(event)),
        }
    }
    Ok(())
}

/// `any`, `no-stream`, `exists`, or a non-negative event number.
pub fn parse_expected_version(raw: &str) -> anyhow::Result<ExpectedVersion> {
    match raw {
        "any" => Ok(ExpectedVersion::Any),
        "no-stream" => Ok(ExpectedVersion::NoStream),
        "exists" => Ok(ExpectedVersion::StreamExists),
        number => match number.parse::<i64>() {
            Ok(n) if n >= 0 => Ok(ExpectedVersion::Exact(n)),
            _ => bail!("invalid expected version {raw:?}"),
        },
    }
}
