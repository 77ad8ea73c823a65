mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{fast_tuning, scripted_node, ScriptedTransport};
use meshrelay::delivery::{
    ChunkStatus, Decoded, DeliveryNode, DeliveryState, FrameCodec, MessageId,
};

fn long_text() -> String {
    "The quick brown fox jumps over the lazy dog near the repeater. ".repeat(5)
}

#[tokio::test]
async fn short_message_goes_out_unframed_without_status() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    let id = node.outbound().send_message("hello bravo", "bravo").await.expect("send");

    let chunks = store.outbound_chunks(&id).expect("chunks");
    assert_eq!(chunks.len(), 1);
    assert!(!chunks[0].framed);
    assert_eq!(chunks[0].status, ChunkStatus::Sent);
    assert!(store.get_status(&id).expect("status").is_none());
    assert_eq!(transport.sent(), vec![("bravo".to_string(), b"hello bravo".to_vec())]);
}

#[tokio::test]
async fn two_failures_then_success_is_sent_with_retry_count_two() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    transport.fail_next(2);
    let id = node.outbound().send_message("ping", "bravo").await.expect("send");

    let chunk = store.get_outbound(&id, 0).expect("read").expect("chunk");
    assert_eq!(chunk.status, ChunkStatus::Sent);
    assert_eq!(chunk.retry_count, 2);
    assert!(chunk.last_error.is_some());
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test]
async fn exhausted_chunk_aborts_sequence_and_abandons_message() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    // First chunk goes through, everything after fails.
    transport.fail_from(1);
    let id = node
        .outbound()
        .send_message(&long_text(), "bravo")
        .await
        .expect("transport errors never reach the caller");

    let chunks = store.outbound_chunks(&id).expect("chunks");
    assert!(chunks.len() >= 3);
    assert_eq!(chunks[0].status, ChunkStatus::Sent);
    assert_eq!(chunks[1].status, ChunkStatus::Failed);
    assert_eq!(chunks[1].retry_count, 3);
    assert!(chunks[2..].iter().all(|c| c.status == ChunkStatus::Pending));
    assert_eq!(transport.attempts(), 1 + 3);

    let status = store.get_status(&id).expect("status").expect("present");
    assert_eq!(status.state, DeliveryState::Abandoned);
    assert!(status.abandon_reason.expect("reason").contains("chunk 1"));
}

#[tokio::test]
async fn oversized_frame_fails_without_retry() {
    let mut tuning = fast_tuning();
    tuning.split_threshold_bytes = 150;
    tuning.max_frame_bytes = 100;
    let (_dir, node, store, transport) = scripted_node(tuning);

    let id = node
        .outbound()
        .send_message(&"z".repeat(120), "bravo")
        .await
        .expect("send");
    let chunk = store.get_outbound(&id, 0).expect("read").expect("chunk");
    assert_eq!(chunk.status, ChunkStatus::Failed);
    assert_eq!(chunk.retry_count, 0);
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn chunks_are_sent_in_index_order() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    let id = node.outbound().send_message(&long_text(), "bravo").await.expect("send");

    let codec = FrameCodec::new(200);
    let indices: Vec<u32> = transport
        .sent()
        .iter()
        .map(|(_, payload)| match codec.decode(payload) {
            Decoded::Chunk(frame) => {
                assert_eq!(frame.message_id, id);
                frame.chunk_index
            }
            other => panic!("expected chunk frame, got {:?}", other),
        })
        .collect();
    let total = store.outbound_chunks(&id).expect("chunks").len() as u32;
    assert_eq!(indices, (0..total).collect::<Vec<_>>());
}

#[tokio::test]
async fn concurrent_sequences_keep_their_own_order() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    let tasks: Vec<_> = (0..4)
        .map(|n| node.outbound().spawn_send(long_text(), format!("peer-{}", n)))
        .collect();
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("join").expect("send"));
    }

    let codec = FrameCodec::new(200);
    let mut seen: HashMap<MessageId, Vec<u32>> = HashMap::new();
    for (_, payload) in transport.sent() {
        if let Decoded::Chunk(frame) = codec.decode(&payload) {
            seen.entry(frame.message_id).or_default().push(frame.chunk_index);
        }
    }
    for id in &ids {
        let order = seen.get(id).expect("frames for message");
        assert!(order.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", order);
        let chunks = store.outbound_chunks(id).expect("chunks");
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Sent));
    }
}

#[tokio::test]
async fn shutdown_during_pacing_leaves_message_resumable() {
    let mut tuning = fast_tuning();
    tuning.inter_chunk_delay = Duration::from_secs(30);
    let (dir, node, store, transport) = scripted_node(tuning);

    let task = node.outbound().spawn_send(long_text(), "bravo");
    while transport.sent_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    node.shutdown();
    let id = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("sequence stops at the pause")
        .expect("join")
        .expect("send");

    let chunks = store.outbound_chunks(&id).expect("chunks");
    assert_eq!(chunks[0].status, ChunkStatus::Sent);
    assert!(chunks[1..].iter().all(|c| c.status == ChunkStatus::Pending));
    assert_eq!(
        store.get_status(&id).expect("status").expect("present").state,
        DeliveryState::InProgress
    );

    // A fresh node over the same store picks the message up again.
    let radio = ScriptedTransport::new("alpha");
    let restarted = DeliveryNode::new(store.clone(), radio.clone(), fast_tuning());
    let resumed = restarted.outbound().resume_incomplete().expect("resume");
    assert_eq!(resumed.len(), 1);
    for task in resumed {
        assert_eq!(task.await.expect("join").expect("deliver"), id);
    }
    let chunks = store.outbound_chunks(&id).expect("chunks");
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Sent));
    assert_eq!(radio.sent_count(), chunks.len() - 1);
    drop(dir);
}

#[tokio::test]
async fn abandoned_messages_are_not_resumed() {
    let (_dir, node, store, transport) = scripted_node(fast_tuning());
    transport.set_fail_always(true);
    let id = node.outbound().send_message(&long_text(), "bravo").await.expect("send");
    assert_eq!(
        store.get_status(&id).expect("status").expect("present").state,
        DeliveryState::Abandoned
    );

    let restarted = DeliveryNode::new(store.clone(), ScriptedTransport::new("alpha"), fast_tuning());
    assert!(restarted.outbound().resume_incomplete().expect("resume").is_empty());
    assert!(!restarted.outbound().resume_message(&id).await.expect("resume"));
}

#[tokio::test]
async fn shutdown_during_retry_wait_keeps_the_spent_attempt() {
    let mut tuning = fast_tuning();
    tuning.retry_delay = Duration::from_secs(30);
    let (_dir, node, store, transport) = scripted_node(tuning);
    transport.fail_next(1);

    let task = node.outbound().spawn_send(long_text(), "bravo");
    while transport.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    node.shutdown();
    let id = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("sequence stops at the retry wait")
        .expect("join")
        .expect("send");

    let first = store.get_outbound(&id, 0).expect("read").expect("chunk");
    assert_eq!(first.status, ChunkStatus::Pending);
    assert_eq!(first.retry_count, 1);
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(
        store.get_status(&id).expect("status").expect("present").state,
        DeliveryState::InProgress
    );

    let restarted = DeliveryNode::new(store.clone(), ScriptedTransport::new("alpha"), fast_tuning());
    for task in restarted.outbound().resume_incomplete().expect("resume") {
        assert_eq!(task.await.expect("join").expect("deliver"), id);
    }
    let chunks = store.outbound_chunks(&id).expect("chunks");
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Sent));
    // The budget carries over; the interrupted wait does not reset it.
    assert_eq!(chunks[0].retry_count, 1);
}
