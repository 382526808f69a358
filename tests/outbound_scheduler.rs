mod common;

use common::{device, MockFactory, Sent, PRIMARY_CAPS};
use meshbridge::packet::NetworkTag;
use meshbridge::router::outbound::CompletionCallback;
use meshbridge::router::{
    start_scheduler, Destination, OutboundHandle, OutboundMessage, SchedulerConfig, SendOutcome, TransportRouter,
};
use meshbridge::supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorRole};
use meshbridge::transport::DirectTarget;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_test::assert_ok;

fn cfg(min_gap_ms: u64, max_queue: usize) -> SchedulerConfig {
    SchedulerConfig {
        min_send_gap: Duration::from_millis(min_gap_ms),
        max_queue,
        aging_threshold: Duration::from_secs(30),
        stats_interval: Duration::ZERO,
    }
}

async fn scheduler(cfg: SchedulerConfig) -> (OutboundHandle, Arc<MockFactory>, ConnectionSupervisor) {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let sup = ConnectionSupervisor::new(
        "primary",
        NetworkTag::Primary,
        SupervisorRole::ReadWrite,
        device(),
        factory.clone(),
        SupervisorConfig::default(),
    );
    sup.start().await;
    let router = Arc::new(TransportRouter::new(NetworkTag::Primary, sup.clone(), None).unwrap());
    (start_scheduler(cfg, router), factory, sup)
}

fn broadcast(text: &str) -> OutboundMessage {
    OutboundMessage {
        network: NetworkTag::Primary,
        destination: Destination::Broadcast { channel: 0 },
        text: text.into(),
    }
}

fn direct(text: &str) -> OutboundMessage {
    OutboundMessage {
        network: NetworkTag::Primary,
        destination: Destination::Direct(DirectTarget {
            node_id: 0x0000_ABCD,
            key_prefix: None,
        }),
        text: text.into(),
    }
}

fn outcome() -> (CompletionCallback, oneshot::Receiver<SendOutcome>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |o| {
            let _ = tx.send(o);
        }),
        rx,
    )
}

fn ignore() -> CompletionCallback {
    Box::new(|_| {})
}

#[tokio::test(start_paused = true)]
async fn dm_preempts_queued_broadcasts() {
    let (handle, radio, _sup) = scheduler(cfg(100, 16)).await;
    for i in 0..3 {
        handle.enqueue(broadcast(&format!("BCAST {i}")), ignore());
    }
    let (cb, done) = outcome();
    handle.enqueue(direct("HELLO DM"), cb);

    assert_eq!(assert_ok!(done.await), SendOutcome::Sent);
    sleep(Duration::from_secs(1)).await;

    let order: Vec<String> = radio.sent().iter().map(|s| s.text().to_string()).collect();
    assert_eq!(order.len(), 4, "{:?}", order);
    let dm = order.iter().position(|t| t == "HELLO DM").unwrap();
    let last_bcast = order.iter().rposition(|t| t.starts_with("BCAST")).unwrap();
    assert!(dm < last_bcast, "DM was not scheduled ahead of queued broadcasts: {:?}", order);
}

#[tokio::test(start_paused = true)]
async fn overflow_drops_oldest_broadcast_not_the_dm() {
    let (handle, radio, _sup) = scheduler(cfg(10, 2)).await;
    let delay = Duration::from_secs(5);
    let (dm_cb, dm_done) = outcome();
    handle.enqueue_after(direct("keep me"), delay, dm_cb);
    let mut broadcasts = Vec::new();
    for i in 0..3 {
        let (cb, rx) = outcome();
        handle.enqueue_after(broadcast(&format!("b{i}")), delay, cb);
        broadcasts.push(rx);
    }

    let stats = handle.snapshot().await.unwrap();
    assert_eq!(stats.dropped_overflow, 2, "{:?}", stats);
    assert_eq!(stats.queued, 2);

    let mut results = broadcasts.into_iter();
    assert_eq!(
        assert_ok!(results.next().unwrap().await),
        SendOutcome::Dropped("queue overflow")
    );
    assert_eq!(
        assert_ok!(results.next().unwrap().await),
        SendOutcome::Dropped("queue overflow")
    );
    assert_eq!(assert_ok!(results.next().unwrap().await), SendOutcome::Sent);
    assert_eq!(assert_ok!(dm_done.await), SendOutcome::Sent);
    assert_eq!(radio.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_send_reaches_the_callback() {
    let (handle, radio, sup) = scheduler(cfg(10, 8)).await;
    sup.shutdown().await;

    let (cb, done) = outcome();
    handle.enqueue(broadcast("into the void"), cb);
    match assert_ok!(done.await) {
        SendOutcome::Failed(reason) => assert!(reason.contains("no connected lane"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(radio.sent().is_empty());
    assert_eq!(handle.snapshot().await.unwrap().failed_total, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_completes_everything_still_queued() {
    let (handle, radio, _sup) = scheduler(cfg(10, 8)).await;
    let (cb, queued) = outcome();
    handle.enqueue_after(broadcast("later"), Duration::from_secs(60), cb);
    handle.shutdown().await;
    assert_eq!(assert_ok!(queued.await), SendOutcome::Dropped("dispatcher stopped"));

    let (cb, late) = outcome();
    handle.enqueue(direct("too late"), cb);
    assert_eq!(assert_ok!(late.await), SendOutcome::Dropped("dispatcher stopped"));
    assert_eq!(
        radio.sent(),
        Vec::<Sent>::new()
    );
}

#[tokio::test(start_paused = true)]
async fn waiting_broadcasts_are_escalated_once() {
    let (handle, radio, _sup) = scheduler(SchedulerConfig {
        min_send_gap: Duration::from_secs(20),
        max_queue: 8,
        aging_threshold: Duration::from_secs(5),
        stats_interval: Duration::ZERO,
    })
    .await;
    for i in 0..3 {
        handle.enqueue(broadcast(&format!("b{i}")), ignore());
    }
    sleep(Duration::from_secs(12)).await;

    let stats = handle.snapshot().await.unwrap();
    assert_eq!(radio.sent().len(), 1);
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.escalations, 2, "{:?}", stats);

    // Already at the top; further waiting does not count again
    sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.snapshot().await.unwrap().escalations, 2);
}
