mod common;

use common::{device, FailKind, MockFactory, CLIENT_CAPS, FRAME_CAPS, PRIMARY_CAPS};
use meshbridge::dedup::PacketDeduplicator;
use meshbridge::packet::{NetworkTag, RawPacket, BROADCAST_ADDR};
use meshbridge::router::TransportRouter;
use meshbridge::supervisor::health::HealthMonitor;
use meshbridge::transport::Transport;
use meshbridge::supervisor::{
    ConnectionState, ConnectionSupervisor, HealthVerdict, PacketSink, StartOutcome, SupervisorConfig, SupervisorRole,
    TriggerReason,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{advance, sleep, Instant};

fn supervisor(name: &str, network: NetworkTag, factory: &Arc<MockFactory>, cfg: SupervisorConfig) -> ConnectionSupervisor {
    ConnectionSupervisor::new(name, network, SupervisorRole::ReadWrite, device(), factory.clone(), cfg)
}

async fn wait_reconnect(sup: &ConnectionSupervisor) {
    while sup.is_reconnecting() {
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn no_false_degraded_before_threshold() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());
    assert_eq!(sup.start().await, StartOutcome::Connected);

    advance(Duration::from_secs(30)).await;
    sup.on_packet_observed();
    advance(Duration::from_secs(89)).await;
    assert_eq!(sup.health_check(), HealthVerdict::Healthy);
    advance(Duration::from_secs(1)).await;
    assert_eq!(sup.health_check(), HealthVerdict::Healthy);
    assert_eq!(sup.state(), ConnectionState::Connected);

    advance(Duration::from_secs(2)).await;
    assert!(matches!(
        sup.health_check(),
        HealthVerdict::ReconnectTriggered(TriggerReason::Silence(_))
    ));
    assert_eq!(sup.state(), ConnectionState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn threshold_decides_whether_a_104s_gap_is_dead() {
    for (threshold, expect_reconnect) in [(90, true), (120, false)] {
        let factory = MockFactory::new("primary", PRIMARY_CAPS);
        let cfg = SupervisorConfig {
            health_check_interval: Duration::from_secs(15),
            silence_threshold: Duration::from_secs(threshold),
            ..Default::default()
        };
        cfg.validate().unwrap();
        let sup = supervisor("primary", NetworkTag::Primary, &factory, cfg);
        sup.start().await;
        sup.on_packet_observed();
        advance(Duration::from_secs(104)).await;
        let verdict = sup.health_check();
        assert_eq!(
            matches!(verdict, HealthVerdict::ReconnectTriggered(TriggerReason::Silence(_))),
            expect_reconnect,
            "threshold {}s gave {:?}",
            threshold,
            verdict
        );
        sup.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn health_check_returns_before_reconnect_finishes() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());
    sup.start().await;
    let first = factory.transports()[0].clone();

    advance(Duration::from_secs(91)).await;
    let before = Instant::now();
    assert!(matches!(sup.health_check(), HealthVerdict::ReconnectTriggered(_)));
    assert_eq!(Instant::now(), before);
    assert!(sup.is_reconnecting());
    assert_eq!(sup.health_check(), HealthVerdict::ReconnectInProgress);

    wait_reconnect(&sup).await;
    assert!(first.is_closed());
    assert_eq!(factory.connects(), 2);
    assert_eq!(sup.state(), ConnectionState::Connected);
    assert_eq!(sup.health_check(), HealthVerdict::Healthy);
}

#[tokio::test(start_paused = true)]
async fn startup_retries_then_leaves_retrying() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    factory.fail_next(3, FailKind::Io);
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());

    assert_eq!(sup.start().await, StartOutcome::Retrying);
    assert_eq!(sup.reconnect_attempts(), 3);
    assert_eq!(sup.state(), ConnectionState::ReconnectScheduled);
    assert!(!sup.is_connected());

    // The next health tick picks it up
    assert_eq!(
        sup.health_check(),
        HealthVerdict::ReconnectTriggered(TriggerReason::Scheduled)
    );
    wait_reconnect(&sup).await;
    assert!(sup.is_connected());
    assert_eq!(sup.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn three_failed_reconnects_oscillate_and_count() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());
    sup.start().await;
    factory.fail_next(3, FailKind::Io);

    advance(Duration::from_secs(91)).await;
    for attempt in 1..=3 {
        assert!(matches!(sup.health_check(), HealthVerdict::ReconnectTriggered(_)));
        wait_reconnect(&sup).await;
        assert_eq!(sup.state(), ConnectionState::ReconnectScheduled);
        assert_eq!(sup.reconnect_attempts(), attempt);
    }
    assert!(matches!(sup.health_check(), HealthVerdict::ReconnectTriggered(TriggerReason::Scheduled)));
    wait_reconnect(&sup).await;
    assert_eq!(sup.state(), ConnectionState::Connected);
    assert_eq!(factory.connects(), 5);
}

#[tokio::test(start_paused = true)]
async fn configuration_failure_is_retried_slowly() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    factory.fail_always(Some(FailKind::Config));
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());

    assert_eq!(sup.start().await, StartOutcome::ConfigurationFailed);
    assert_eq!(factory.connects(), 1);
    assert_eq!(sup.state(), ConnectionState::Disconnected);
    assert_eq!(sup.health_check(), HealthVerdict::WaitingForConfig);

    advance(Duration::from_secs(150)).await;
    assert_eq!(sup.health_check(), HealthVerdict::WaitingForConfig);

    factory.fail_always(None);
    advance(Duration::from_secs(151)).await;
    assert!(matches!(sup.health_check(), HealthVerdict::ReconnectTriggered(_)));
    wait_reconnect(&sup).await;
    assert!(sup.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnecting_one_network_leaves_the_other_alone() {
    let pf = MockFactory::new("primary", PRIMARY_CAPS);
    let cf = MockFactory::new("companion", PRIMARY_CAPS);
    let a = supervisor("primary", NetworkTag::Primary, &pf, SupervisorConfig::default());
    let b = supervisor("companion", NetworkTag::Companion, &cf, SupervisorConfig::default());
    a.start().await;
    b.start().await;

    advance(Duration::from_secs(80)).await;
    b.on_packet_observed();
    let b_activity = b.last_activity();
    advance(Duration::from_secs(11)).await;

    let monitor = HealthMonitor::new(vec![a.clone(), b.clone()], Arc::new(PacketDeduplicator::default()), Duration::from_secs(15));
    let verdicts = monitor.tick();
    assert!(matches!(verdicts[0].1, HealthVerdict::ReconnectTriggered(_)));
    assert_eq!(verdicts[1].1, HealthVerdict::Healthy);

    wait_reconnect(&a).await;
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(b.last_activity(), b_activity);
    assert_eq!(cf.connects(), 1);
    assert_eq!(pf.connects(), 2);
}

struct Collect(Mutex<Vec<RawPacket>>);

#[async_trait::async_trait]
impl PacketSink for Collect {
    async fn ingest(&self, packet: RawPacket) {
        self.0.lock().unwrap().push(packet);
    }
}

#[tokio::test(start_paused = true)]
async fn read_loop_survives_link_loss_and_resumes_on_new_transport() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let sup = supervisor("primary", NetworkTag::Primary, &factory, SupervisorConfig::default());
    sup.start().await;
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    let handle = sup.spawn_read_loop(sink.clone()).unwrap();

    assert!(factory.feed(RawPacket::text(NetworkTag::Primary, 7, BROADCAST_ADDR, "one")));
    sleep(Duration::from_millis(10)).await;

    factory.hang_up();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        sup.health_check(),
        HealthVerdict::ReconnectTriggered(TriggerReason::LinkLost)
    );
    wait_reconnect(&sup).await;

    assert!(factory.feed(RawPacket::text(NetworkTag::Primary, 7, BROADCAST_ADDR, "two")));
    sleep(Duration::from_millis(10)).await;
    let texts: Vec<String> = sink.0.lock().unwrap().iter().map(|p| p.text_lossy()).collect();
    assert_eq!(texts, vec!["one", "two"]);

    sup.shutdown().await;
    handle.await.unwrap();
    assert_eq!(sup.health_check(), HealthVerdict::ShutDown);
    assert_eq!(sup.state(), ConnectionState::Shutdown);
}

#[tokio::test]
async fn send_only_lane_refuses_a_read_loop() {
    let factory = MockFactory::new("frame", PRIMARY_CAPS);
    let sup = ConnectionSupervisor::new(
        "frame",
        NetworkTag::Companion,
        SupervisorRole::SendOnly,
        device(),
        factory,
        SupervisorConfig::default(),
    );
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    assert!(sup.spawn_read_loop(sink).is_err());
}

#[tokio::test(start_paused = true)]
async fn unroutable_frames_keep_the_lane_alive() {
    let factory = MockFactory::new("primary", PRIMARY_CAPS);
    let cfg = SupervisorConfig {
        health_check_interval: Duration::from_millis(50),
        silence_threshold: Duration::from_millis(200),
        ..Default::default()
    };
    cfg.validate().unwrap();
    let sup = supervisor("primary", NetworkTag::Primary, &factory, cfg);
    sup.start().await;
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    let _handle = sup.spawn_read_loop(sink.clone()).unwrap();

    // Encrypted packets only: nothing to deliver, but the radio is clearly talking
    for tick in 0..40 {
        assert!(factory.feed_noise());
        sleep(Duration::from_millis(25)).await;
        if tick % 2 == 1 {
            assert_eq!(sup.health_check(), HealthVerdict::Healthy, "tick {}", tick);
        }
    }
    assert!(sink.0.lock().unwrap().is_empty());
    assert_eq!(factory.connects(), 1);

    // Once the noise stops the lane is silent again
    sleep(Duration::from_millis(250)).await;
    assert!(matches!(
        sup.health_check(),
        HealthVerdict::ReconnectTriggered(TriggerReason::Silence(_))
    ));
}

struct Hybrid {
    router: TransportRouter,
    client: ConnectionSupervisor,
    frame: ConnectionSupervisor,
    client_radio: Arc<MockFactory>,
    frame_radio: Arc<MockFactory>,
}

async fn hybrid() -> Hybrid {
    let client_radio = MockFactory::new("companion-client", CLIENT_CAPS);
    let frame_radio = MockFactory::new("companion-frame", FRAME_CAPS);
    let client = supervisor("companion-client", NetworkTag::Companion, &client_radio, SupervisorConfig::default());
    let frame = ConnectionSupervisor::new(
        "companion-frame",
        NetworkTag::Companion,
        SupervisorRole::SendOnly,
        device(),
        frame_radio.clone(),
        SupervisorConfig::default(),
    );
    client.start().await;
    frame.start().await;
    let router = TransportRouter::new(NetworkTag::Companion, client.clone(), Some(frame.clone())).unwrap();
    Hybrid {
        router,
        client,
        frame,
        client_radio,
        frame_radio,
    }
}

#[tokio::test(start_paused = true)]
async fn send_only_lane_stays_healthy_while_the_reader_hears_traffic() {
    let h = hybrid().await;
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    let _handle = h.client.spawn_read_loop(sink.clone()).unwrap();

    let mut elapsed = Duration::ZERO;
    let mut n = 0;
    while elapsed < Duration::from_secs(840) {
        assert!(h
            .client_radio
            .feed(RawPacket::text(NetworkTag::Companion, 0, BROADCAST_ADDR, &format!("Bob: msg {n}"))));
        n += 1;
        sleep(Duration::from_secs(21)).await;
        elapsed += Duration::from_secs(21);
        assert_eq!(h.client.health_check(), HealthVerdict::Healthy);
        assert_eq!(h.frame.health_check(), HealthVerdict::Healthy, "after {:?}", elapsed);
    }
    assert_eq!(sink.0.lock().unwrap().len(), n);
    assert_eq!(h.frame_radio.connects(), 1);
    assert_eq!(h.client_radio.connects(), 1);
    assert_eq!(h.frame_radio.roles(), vec![SupervisorRole::SendOnly]);
    assert_eq!(h.client_radio.roles(), vec![SupervisorRole::ReadWrite]);
}

#[tokio::test(start_paused = true)]
async fn send_only_lane_reconnects_after_a_failed_write() {
    let h = hybrid().await;
    // The radio drops the frame lane; only the next write notices
    h.frame_radio.transports()[0].close().await;
    assert_eq!(h.frame.health_check(), HealthVerdict::Healthy);

    assert!(h.router.send_broadcast(0, "anyone?").await.is_err());
    assert_eq!(
        h.frame.health_check(),
        HealthVerdict::ReconnectTriggered(TriggerReason::LinkLost)
    );
    wait_reconnect(&h.frame).await;
    assert!(h.frame.is_connected());
    assert_eq!(h.frame_radio.connects(), 2);

    h.router.send_broadcast(0, "anyone?").await.unwrap();
    assert_eq!(h.frame_radio.sent().len(), 1);
    assert_eq!(h.client_radio.connects(), 1);
}
