//! End-to-end fragmentation: paced trains, progress events, cancellation.

mod common;

use common::*;
use ember_core::engine::{TLV_FILE_CONTENT, TLV_FILE_NAME};
use ember_core::protocol::TlvReader;
use ember_core::{ManualClock, MeshEvent, MessageType, TransferEvent};

#[tokio::test(start_paused = true)]
async fn oversized_message_fragments_and_reassembles() {
    let clock = ManualClock::new(1_000_000);
    let mut a = spawn_node(&clock, 1);
    let mut b = spawn_node(&clock, 2);
    connect(&a, &b, 10, 20).await;
    converge(&clock, &a, &b).await;
    drain_all(&mut a);
    drain_all(&mut b);

    let body = noise_bytes(6_000, 42);
    let transfer = a
        .engine
        .send_message(None, body.clone())
        .await
        .unwrap()
        .expect("payload larger than a frame must fragment");

    let delivered = next_message(&mut b).await;
    assert_eq!(delivered.payload, body);
    assert_eq!(delivered.sender, a.id);
    assert_eq!(delivered.msg_type, MessageType::Message);

    // Sender observed monotonic progress ending in completion.
    let mut last_sent = 0;
    let mut completed = false;
    while let Ok(event) = a.events.try_recv() {
        match event {
            MeshEvent::Transfer(TransferEvent::Progress { id, sent, total }) => {
                assert_eq!(id, transfer);
                assert!(sent > last_sent);
                assert!(sent < total);
                last_sent = sent;
            }
            MeshEvent::Transfer(TransferEvent::Complete { id }) => {
                assert_eq!(id, transfer);
                completed = true;
            }
            _ => {}
        }
    }
    assert!(completed, "transfer never completed");
}

#[tokio::test(start_paused = true)]
async fn cancelled_transfer_stops_mid_train() {
    let clock = ManualClock::new(1_000_000);
    let mut a = spawn_node(&clock, 3);
    let mut b = spawn_node(&clock, 4);
    connect(&a, &b, 10, 20).await;
    converge(&clock, &a, &b).await;
    drain_all(&mut a);
    drain_all(&mut b);

    let body = noise_bytes(60_000, 7);
    let transfer = a
        .engine
        .send_message(None, body)
        .await
        .unwrap()
        .expect("must fragment");
    a.engine.cancel_transfer(transfer).await.unwrap();
    settle(&clock, 100).await;

    let mut cancelled = false;
    while let Ok(event) = a.events.try_recv() {
        match event {
            MeshEvent::Transfer(TransferEvent::Cancelled { id, sent, total }) => {
                assert_eq!(id, transfer);
                assert!(sent < total, "cancel after the train finished");
                cancelled = true;
            }
            MeshEvent::Transfer(TransferEvent::Complete { .. }) => {
                panic!("cancelled transfer completed");
            }
            _ => {}
        }
    }
    assert!(cancelled, "no cancellation event");

    // The receiver never assembles a message, and the sender's transfer
    // bookkeeping is gone.
    assert!(drain_messages(&mut b).is_empty());
    let stats = a.engine.stats().await.unwrap();
    assert_eq!(stats.active_transfers, 0);
}

#[tokio::test(start_paused = true)]
async fn file_transfer_carries_name_and_content() {
    let clock = ManualClock::new(1_000_000);
    let mut a = spawn_node(&clock, 5);
    let mut b = spawn_node(&clock, 6);
    connect(&a, &b, 10, 20).await;
    converge(&clock, &a, &b).await;
    drain_all(&mut a);
    drain_all(&mut b);

    let content = noise_bytes(3_000, 99);
    a.engine
        .send_file(Some(b.id), "notes.txt".to_string(), content.clone())
        .await
        .unwrap();

    let delivered = next_message(&mut b).await;
    assert_eq!(delivered.msg_type, MessageType::FileTransfer);

    let mut reader = TlvReader::with_wide_types(&delivered.payload, &[TLV_FILE_CONTENT]);
    let mut name = None;
    let mut body = None;
    while let Some(field) = reader.next_field().unwrap() {
        match field.tlv_type {
            TLV_FILE_NAME => name = Some(field.value.to_vec()),
            TLV_FILE_CONTENT => body = Some(field.value.to_vec()),
            _ => {}
        }
    }
    assert_eq!(name.as_deref(), Some(b"notes.txt".as_slice()));
    assert_eq!(body, Some(content));
}
