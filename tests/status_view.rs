mod common;

use std::time::Duration;

use chrono::Utc;
use common::{fast_tuning, scripted_node};
use meshrelay::delivery::{ChunkStatus, DeliveryState, MessageId};

#[tokio::test]
async fn report_shows_abandoned_sequence() {
    let (_dir, node, _store, radio) = scripted_node(fast_tuning());
    radio.fail_from(1);
    let id = node
        .outbound()
        .send_message(&"status check ".repeat(30), "bravo")
        .await
        .expect("send");

    let report = node.status_view().message_report(&id).unwrap().expect("report");
    let status = report.status.expect("framed message has status");
    assert_eq!(status.state, DeliveryState::Abandoned);
    assert_eq!(report.tally.sent, 1);
    assert_eq!(report.tally.failed, 1);
    assert_eq!(report.tally.pending, report.chunks.len() - 2);
    // Abandoned: nothing left is waiting on the peer.
    assert_eq!(report.tally.unconfirmable, report.chunks.len() - 1);
    assert_eq!(report.tally.outstanding(), 0);
    assert!(node
        .status_view()
        .message_report(&MessageId::from("missing"))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn tally_spans_all_messages() {
    let (_dir, node, _store, radio) = scripted_node(fast_tuning());
    node.outbound().send_message("one", "bravo").await.unwrap();
    node.outbound().send_message("two", "bravo").await.unwrap();
    radio.set_fail_always(true);
    node.outbound().send_message("three", "bravo").await.unwrap();

    let tally = node.status_view().chunk_tally().unwrap();
    assert_eq!(tally.sent, 2);
    assert_eq!(tally.failed, 1);
    // Unframed chunks are never confirmed, so they never stay outstanding.
    assert_eq!(tally.unconfirmable, 2);
    assert_eq!(tally.outstanding(), 0);
    assert_eq!(tally.total(), 3);
}

#[tokio::test]
async fn outstanding_drains_as_confirmations_arrive() {
    let (_dir, node, store, _radio) = scripted_node(fast_tuning());
    node.outbound().send_message("hi", "bravo").await.unwrap();
    let id = node
        .outbound()
        .send_message(&"long haul ".repeat(40), "bravo")
        .await
        .unwrap();
    let total = store.get_status(&id).unwrap().expect("status").total_chunks;

    let tally = node.status_view().chunk_tally().unwrap();
    assert_eq!(tally.outstanding(), total as usize);
    assert_eq!(tally.unconfirmable, 1);

    for i in 0..total {
        let ack = format!(r#"{{"t":"ack","id":"{}","i":{},"ts":0}}"#, id, i);
        node.reassembler()
            .on_frame_received(ack.as_bytes(), "bravo")
            .expect("process");
    }
    let tally = node.status_view().chunk_tally().unwrap();
    assert_eq!(tally.confirmed, total as usize);
    assert_eq!(tally.outstanding(), 0);
}

#[tokio::test]
async fn retry_candidates_are_failed_chunks_with_attempts_left() {
    let mut tuning = fast_tuning();
    tuning.max_frame_bytes = 100;
    let (_dir, node, _store, radio) = scripted_node(tuning);

    // Oversized: fails terminally with no attempts used.
    let oversized = node.outbound().send_message(&"o".repeat(140), "bravo").await.unwrap();
    // Exhausted: every attempt used.
    radio.set_fail_always(true);
    let exhausted = node.outbound().send_message("busy", "bravo").await.unwrap();

    let candidates = node.status_view().retry_candidates(3).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].message_id, oversized);
    assert_eq!(candidates[0].status, ChunkStatus::Failed);

    let with_more_budget = node.status_view().retry_candidates(5).unwrap();
    assert!(with_more_budget.iter().any(|c| c.message_id == exhausted));
}

#[tokio::test]
async fn statuses_list_newest_first() {
    let (_dir, node, _store, _radio) = scripted_node(fast_tuning());
    let older = node.outbound().send_message(&"a ".repeat(100), "bravo").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let newer = node.outbound().send_message(&"b ".repeat(100), "bravo").await.unwrap();

    let statuses = node.status_view().list_statuses().unwrap();
    let ids: Vec<_> = statuses.iter().map(|s| s.message_id.clone()).collect();
    assert_eq!(ids, vec![newer, older]);
}

#[tokio::test]
async fn purge_removes_only_finished_records_past_cutoff() {
    let (_dir, node, store, radio) = scripted_node(fast_tuning());
    radio.set_fail_always(true);
    let abandoned = node.outbound().send_message(&"x ".repeat(100), "bravo").await.unwrap();
    radio.set_fail_always(false);
    let unframed = node.outbound().send_message("short", "bravo").await.unwrap();

    // Nothing is old enough yet.
    let report = store
        .purge_older_than(Utc::now() - chrono::Duration::days(1))
        .unwrap();
    assert_eq!(report.outbound_chunks, 0);

    let report = store
        .purge_older_than(Utc::now() + chrono::Duration::seconds(5))
        .unwrap();
    assert_eq!(report.statuses, 1);
    assert!(store.outbound_chunks(&abandoned).unwrap().is_empty());
    assert!(store.outbound_chunks(&unframed).unwrap().is_empty());
}
