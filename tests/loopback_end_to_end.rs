mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fast_tuning;
use meshrelay::delivery::{CompletedMessage, DeliveryNode, DeliveryState, MessageId};
use meshrelay::storage::{DeliveryStore, SledStoreBuilder};
use meshrelay::transport::loopback_pair;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Pair {
    alpha: Arc<DeliveryNode>,
    bravo: Arc<DeliveryNode>,
    bravo_inbox: mpsc::UnboundedReceiver<CompletedMessage>,
    /// Held so alpha's loop is not stopped by a closed completion receiver.
    _alpha_inbox: mpsc::UnboundedReceiver<CompletedMessage>,
    loops: Vec<JoinHandle<()>>,
}

fn pair() -> Pair {
    let ((alpha_tx, alpha_rx), (bravo_tx, bravo_rx)) = loopback_pair("alpha", "bravo");
    let alpha_store: Arc<dyn DeliveryStore> =
        Arc::new(SledStoreBuilder::temporary().open().expect("alpha store"));
    let bravo_store: Arc<dyn DeliveryStore> =
        Arc::new(SledStoreBuilder::temporary().open().expect("bravo store"));
    let alpha = Arc::new(DeliveryNode::new(alpha_store, Arc::new(alpha_tx), fast_tuning()));
    let bravo = Arc::new(DeliveryNode::new(bravo_store, Arc::new(bravo_tx), fast_tuning()));

    let (alpha_done, alpha_inbox) = mpsc::unbounded_channel();
    let (bravo_done, bravo_inbox) = mpsc::unbounded_channel();
    let loops = vec![
        {
            let node = alpha.clone();
            tokio::spawn(async move { node.run_inbound(alpha_rx, alpha_done).await })
        },
        {
            let node = bravo.clone();
            tokio::spawn(async move { node.run_inbound(bravo_rx, bravo_done).await })
        },
    ];
    Pair {
        alpha,
        bravo,
        bravo_inbox,
        _alpha_inbox: alpha_inbox,
        loops,
    }
}

async fn wait_for_state(node: &DeliveryNode, id: &MessageId, want: DeliveryState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = node
            .status_view()
            .message_report(id)
            .expect("report")
            .and_then(|r| r.status)
            .map(|s| s.state);
        if state == Some(want) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message {} stuck in {:?}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn long_unicode_message_arrives_intact_and_completes() {
    let mut p = pair();
    let text = "Ørsted relay check: ☀️ clear skies, wind 12kt NNE, trail open to the ridge. ".repeat(4);

    let id = p.alpha.outbound().send_message(&text, "bravo").await.expect("send");
    let received = tokio::time::timeout(Duration::from_secs(5), p.bravo_inbox.recv())
        .await
        .expect("reassembled in time")
        .expect("inbox open");

    assert_eq!(received.text, text);
    assert_eq!(received.message_id.as_ref(), Some(&id));
    assert_eq!(received.sender, "alpha");
    assert!(received.chunk_count > 1);

    wait_for_state(&p.alpha, &id, DeliveryState::Completed).await;
    let report = p.alpha.status_view().message_report(&id).unwrap().expect("report");
    assert_eq!(report.tally.confirmed, received.chunk_count as usize);
}

#[tokio::test]
async fn short_message_arrives_as_plain_text() {
    let mut p = pair();
    p.alpha.outbound().send_message("rsvp by noon", "bravo").await.expect("send");
    let received = tokio::time::timeout(Duration::from_secs(5), p.bravo_inbox.recv())
        .await
        .expect("delivered in time")
        .expect("inbox open");
    assert_eq!(received.text, "rsvp by noon");
    assert!(received.message_id.is_none());
}

#[tokio::test]
async fn shutdown_stops_inbound_loops() {
    let p = pair();
    p.alpha.shutdown();
    p.bravo.shutdown();
    assert!(p.bravo.is_shutting_down());
    for handle in p.loops {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits after shutdown")
            .expect("join");
    }
}
