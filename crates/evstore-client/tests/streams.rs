//! Stream operations against the in-process server.

mod common;

use common::{FakeServer, events, numbers};
use evstore_client::{ClientError, EventData, ExpectedVersion, Position};
use evstore_core::{
    DeleteResult, EventReadStatus, SliceReadStatus, StreamMetadata, WriteResult,
};
use evstore_proto::{Command, UserCredentials};

#[tokio::test]
async fn append_to_fresh_stream_reports_version_and_position() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    conn.append_to_stream("seed", ExpectedVersion::Any, events(1, "Seeded"), None)
        .await
        .unwrap();
    let before = conn
        .read_all_events_backward(Position::END, 1, false, None)
        .await
        .unwrap();
    let before = before.events[0].original_position.unwrap();

    let result = conn
        .append_to_stream("orders-1", ExpectedVersion::Any, events(4, "OrderPlaced"), None)
        .await
        .unwrap();
    match result {
        WriteResult::Success {
            next_expected_version,
            log_position,
        } => {
            assert_eq!(next_expected_version, 3);
            assert!(log_position.commit_position > before.commit_position);
        }
        other => panic!("unexpected {other:?}"),
    }
    conn.close().await;
}

#[tokio::test]
async fn wrong_expected_version_is_a_result_not_an_error() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    conn.append_to_stream("orders-2", ExpectedVersion::NoStream, events(2, "OrderPlaced"), None)
        .await
        .unwrap();
    let result = conn
        .append_to_stream("orders-2", ExpectedVersion::NoStream, events(1, "OrderPlaced"), None)
        .await
        .unwrap();
    assert!(
        matches!(result, WriteResult::WrongExpectedVersion { current_version: Some(1), .. }),
        "{result:?}"
    );

    let result = conn
        .append_to_stream("orders-2", ExpectedVersion::Exact(1), events(1, "OrderShipped"), None)
        .await
        .unwrap();
    assert!(matches!(result, WriteResult::Success { next_expected_version: 2, .. }));
    conn.close().await;
}

#[tokio::test]
async fn sequential_writes_complete_in_submission_order() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    let mut versions = Vec::new();
    for i in 0..10 {
        let event = EventData::new("Tick", false, format!("{i}"));
        match conn
            .append_to_stream("ticks", ExpectedVersion::Any, vec![event], None)
            .await
            .unwrap()
        {
            WriteResult::Success { next_expected_version, .. } => versions.push(next_expected_version),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(versions, (0..10).collect::<Vec<i64>>());

    let slice = conn
        .read_stream_events_forward("ticks", 0, 100, false, None)
        .await
        .unwrap();
    let payloads: Vec<String> = slice
        .events
        .iter()
        .map(|e| String::from_utf8(e.event.as_ref().unwrap().data.to_vec()).unwrap())
        .collect();
    assert_eq!(payloads, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    conn.close().await;
}

#[tokio::test]
async fn concurrent_writes_all_complete_once() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.append_to_stream("busy", ExpectedVersion::Any, events(1, "Hit"), None)
                    .await
            })
        })
        .collect();
    let mut versions = Vec::new();
    for task in tasks {
        match task.await.unwrap().unwrap() {
            WriteResult::Success { next_expected_version, .. } => versions.push(next_expected_version),
            other => panic!("unexpected {other:?}"),
        }
    }
    versions.sort();
    assert_eq!(versions, (0..20).collect::<Vec<i64>>());
    assert_eq!(server.stream_len("busy"), 20);
    conn.close().await;
}

#[tokio::test]
async fn reads_in_both_directions() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;
    conn.append_to_stream("letters", ExpectedVersion::Any, events(5, "Letter"), None)
        .await
        .unwrap();

    let forward = conn
        .read_stream_events_forward("letters", 1, 2, false, None)
        .await
        .unwrap();
    assert_eq!(forward.status, SliceReadStatus::Success);
    assert_eq!(numbers(&forward.events), vec![1, 2]);
    assert_eq!(forward.next_event_number, 3);
    assert!(!forward.is_end_of_stream);

    let backward = conn
        .read_stream_events_backward("letters", -1, 3, false, None)
        .await
        .unwrap();
    assert_eq!(numbers(&backward.events), vec![4, 3, 2]);

    let last = conn.read_event("letters", -1, false, None).await.unwrap();
    assert_eq!(last.status, EventReadStatus::Success);
    assert_eq!(last.event.unwrap().original_event_number(), Some(4));

    let missing = conn.read_event("letters", 99, false, None).await.unwrap();
    assert_eq!(missing.status, EventReadStatus::NotFound);

    let no_stream = conn
        .read_stream_events_forward("nothing-here", 0, 10, false, None)
        .await
        .unwrap();
    assert_eq!(no_stream.status, SliceReadStatus::StreamNotFound);
    assert!(no_stream.events.is_empty());

    let all = conn
        .read_all_events_forward(Position::START, 100, false, None)
        .await
        .unwrap();
    assert_eq!(all.events.len(), 5);
    let positions: Vec<Position> = all.events.iter().filter_map(|e| e.original_position).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    conn.close().await;
}

#[tokio::test]
async fn deleted_stream_rejects_writes() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;
    conn.append_to_stream("doomed", ExpectedVersion::Any, events(1, "Created"), None)
        .await
        .unwrap();

    let deleted = conn
        .delete_stream("doomed", ExpectedVersion::Any, true, None)
        .await
        .unwrap();
    assert!(matches!(deleted, DeleteResult::Success { .. }));

    let write = conn
        .append_to_stream("doomed", ExpectedVersion::Any, events(1, "Revived"), None)
        .await
        .unwrap();
    assert_eq!(write, WriteResult::StreamDeleted);

    let read = conn.read_event("doomed", 0, false, None).await.unwrap();
    assert_eq!(read.status, EventReadStatus::StreamDeleted);
    conn.close().await;
}

#[tokio::test]
async fn stream_metadata_round_trips_through_the_metastream() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    let empty = conn.get_stream_metadata("invoices", None).await.unwrap();
    assert_eq!(empty.metastream_version, -1);
    assert_eq!(empty.metadata, StreamMetadata::default());

    let mut metadata = StreamMetadata {
        max_count: Some(50),
        ..Default::default()
    };
    metadata.custom.insert("owner".into(), serde_json::json!("billing"));
    let write = conn
        .set_stream_metadata("invoices", ExpectedVersion::NoStream, &metadata, None)
        .await
        .unwrap();
    assert!(write.is_success());
    assert_eq!(server.stream_len("$$invoices"), 1);

    let read = conn.get_stream_metadata("invoices", None).await.unwrap();
    assert_eq!(read.metastream_version, 0);
    assert_eq!(read.metadata, metadata);
    conn.close().await;
}

#[tokio::test]
async fn persistent_group_management_maps_results() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;
    let settings = evstore_core::PersistentSubscriptionSettings::default();

    conn.create_persistent_subscription("jobs", "workers", settings.clone(), None)
        .await
        .unwrap();
    let again = conn
        .create_persistent_subscription("jobs", "workers", settings.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(again, ClientError::InvalidOperation(_)), "{again}");

    conn.update_persistent_subscription("jobs", "workers", settings.clone(), None)
        .await
        .unwrap();
    conn.delete_persistent_subscription("jobs", "workers", None)
        .await
        .unwrap();
    let missing = conn
        .update_persistent_subscription("jobs", "workers", settings, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, ClientError::InvalidOperation(_)), "{missing}");
    conn.close().await;
}

#[tokio::test]
async fn oversized_credentials_fail_the_call_without_touching_the_connection() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    let started = std::time::Instant::now();
    let credentials = UserCredentials::new("u".repeat(300), "p");
    let err = conn
        .append_to_stream("guarded", ExpectedVersion::Any, events(1, "Denied"), Some(credentials))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "{err}");
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
    assert_eq!(server.received(Command::WriteEvents), 0);

    conn.append_to_stream("guarded", ExpectedVersion::Any, events(1, "Allowed"), None)
        .await
        .unwrap();
    assert_eq!(server.stream_len("guarded"), 1);
    assert_eq!(server.received(Command::IdentifyClient), 1);
    conn.close().await;
}

#[tokio::test]
async fn oversized_append_fails_before_reaching_the_server() {
    let server = FakeServer::start().await;
    let conn = server.connect().await;

    let huge = EventData::new("Blob", false, vec![0u8; evstore_proto::MAX_PACKAGE_SIZE]);
    let err = conn
        .append_to_stream("blobs", ExpectedVersion::Any, vec![huge], None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds"), "{err}");
    assert_eq!(server.received(Command::WriteEvents), 0);
    conn.close().await;
}
