//! Router ordering under concurrent senders.

use std::collections::HashMap;

use futures::StreamExt;
use orchestra::orchestration::{
    Address, Message, MessageKind, MessageRouter, Outbox, RouterEvent, WorkerId,
};
use serde_json::json;

/// Given several workers sending to the coordinator at the same time
/// When the coordinator drains its mailbox
/// Then each sender's messages arrive in the order they were sent
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_sender_order_survives_interleaving() {
    const SENDERS: usize = 4;
    const PER_SENDER: u64 = 50;

    let (router, mut events) = MessageRouter::new();
    let inbox = router.register(Address::Coordinator);

    let mut handles = Vec::new();
    for _ in 0..SENDERS {
        let outbox = Outbox::new(Address::Worker(WorkerId::new()), router.clone());
        handles.push(tokio::spawn(async move {
            for i in 1..=PER_SENDER {
                outbox
                    .send(Address::Coordinator, MessageKind::Progress, json!({ "i": i }))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let received: Vec<Message> = inbox
        .stream()
        .take(SENDERS * PER_SENDER as usize)
        .collect()
        .await;

    let mut per_sender: HashMap<Address, Vec<(u64, u64)>> = HashMap::new();
    for msg in received {
        let i = msg.payload["i"].as_u64().unwrap();
        per_sender
            .entry(msg.from)
            .or_default()
            .push((msg.sequence_number, i));
    }
    assert_eq!(per_sender.len(), SENDERS);
    for seen in per_sender.values() {
        let expected: Vec<(u64, u64)> = (1..=PER_SENDER).map(|i| (i, i)).collect();
        assert_eq!(seen, &expected);
    }
    assert!(events.try_recv().is_err(), "no gaps or drops expected");
}

/// A skipped number is reported and the later message still delivered;
/// the late one is then dropped.
#[tokio::test]
async fn test_gap_reported_and_late_message_dropped() {
    let (router, mut events) = MessageRouter::new();
    let inbox = router.register(Address::Coordinator);
    let worker = Address::Worker(WorkerId::new());
    let msg = |seq: u64| {
        Message::new(worker, Address::Coordinator, MessageKind::Progress, json!(seq))
            .with_sequence(seq)
    };

    router.send(msg(1)).unwrap();
    router.send(msg(3)).unwrap();
    router.send(msg(2)).unwrap();

    assert_eq!(inbox.recv().await.unwrap().sequence_number, 1);
    assert_eq!(inbox.recv().await.unwrap().sequence_number, 3);
    assert!(inbox.try_recv().is_none());

    assert_eq!(
        events.recv().await.unwrap(),
        RouterEvent::GapDetected {
            from: worker,
            to: Address::Coordinator,
            expected: 2,
            received: 3,
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RouterEvent::Dropped {
            from: worker,
            to: Address::Coordinator,
            last_delivered: 3,
            received: 2,
        }
    );
}

/// Numbering is per recipient: one sender's streams to two recipients
/// are independent.
#[tokio::test]
async fn test_sequences_are_per_recipient() {
    let (router, mut events) = MessageRouter::new();
    let a = Address::Worker(WorkerId::new());
    let b = Address::Worker(WorkerId::new());
    let mailbox_a = router.register(a);
    let mailbox_b = router.register(b);
    let outbox = Outbox::new(Address::Coordinator, router.clone());

    assert_eq!(outbox.send(a, MessageKind::Assign, json!(null)).unwrap(), 1);
    assert_eq!(outbox.send(b, MessageKind::Assign, json!(null)).unwrap(), 1);
    assert_eq!(outbox.send(a, MessageKind::Guidance, json!(null)).unwrap(), 2);

    assert_eq!(mailbox_a.recv().await.unwrap().kind, MessageKind::Assign);
    assert_eq!(mailbox_a.recv().await.unwrap().kind, MessageKind::Guidance);
    assert_eq!(mailbox_b.recv().await.unwrap().sequence_number, 1);
    assert!(events.try_recv().is_err());
}
