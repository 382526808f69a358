mod common;

use common::{device, FailKind, MockFactory, Sent, CLIENT_CAPS, FRAME_CAPS};
use meshbridge::packet::{KeyPrefix, NetworkTag};
use meshbridge::router::{Operation, RoutingError, TransportRouter};
use meshbridge::supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorRole};
use meshbridge::transport::DirectTarget;
use std::sync::{Arc, Mutex};

fn sup(name: &str, role: SupervisorRole, factory: &Arc<MockFactory>) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        name,
        NetworkTag::Companion,
        role,
        device(),
        factory.clone(),
        SupervisorConfig::default(),
    )
}

struct Hybrid {
    router: TransportRouter,
    client: ConnectionSupervisor,
    frame: ConnectionSupervisor,
    log: Arc<MockFactory>,
}

async fn hybrid() -> Hybrid {
    let log = Arc::new(Mutex::new(Vec::new()));
    let client_factory = MockFactory::with_log("companion-client", CLIENT_CAPS, None, log.clone());
    let frame_factory = MockFactory::with_log("companion-frame", FRAME_CAPS, None, log);
    let client = sup("companion-client", SupervisorRole::ReadWrite, &client_factory);
    let frame = sup("companion-frame", SupervisorRole::SendOnly, &frame_factory);
    client.start().await;
    frame.start().await;
    let router = TransportRouter::new(NetworkTag::Companion, client.clone(), Some(frame.clone())).unwrap();
    Hybrid {
        router,
        client,
        frame,
        log: client_factory,
    }
}

fn target() -> DirectTarget {
    DirectTarget {
        node_id: 0x3132_3334,
        key_prefix: Some(KeyPrefix([0x31, 0x32, 0x33, 0x34, 0x35, 0x36])),
    }
}

#[tokio::test]
async fn broadcasts_prefer_frame_lane_and_directs_prefer_client() {
    let h = hybrid().await;
    assert_eq!(h.router.read_owner().name(), "companion-client");

    h.router.send_broadcast(0, "hello channel").await.unwrap();
    h.router.send_direct(&target(), "hello you").await.unwrap();

    let lanes: Vec<String> = h.log.sent().iter().map(|s| s.lane().to_string()).collect();
    assert_eq!(lanes, vec!["companion-frame", "companion-client"]);
}

#[tokio::test]
async fn broadcast_falls_back_when_frame_lane_is_down() {
    let h = hybrid().await;
    h.frame.shutdown().await;

    assert_eq!(h.router.select_lane(Operation::Broadcast).unwrap().name(), "companion-client");
    h.router.send_broadcast(1, "still here").await.unwrap();
    assert_eq!(
        h.log.sent(),
        vec![Sent::Broadcast {
            lane: "companion-client".into(),
            channel: 1,
            text: "still here".into(),
        }]
    );
}

#[tokio::test]
async fn direct_never_falls_back_to_a_lane_without_addressing() {
    let h = hybrid().await;
    h.client.shutdown().await;

    assert!(h.router.select_lane(Operation::Direct).is_none());
    let err = h.router.send_direct(&target(), "lost").await.unwrap_err();
    assert!(matches!(err, RoutingError::NoConnectedLane { .. }), "{}", err);
    // Broadcasts still go out on the frame lane
    h.router.send_broadcast(0, "ok").await.unwrap();
    assert_eq!(h.log.sent().len(), 1);
}

#[tokio::test]
async fn single_lane_takes_everything() {
    let factory = MockFactory::new("companion-frame", FRAME_CAPS);
    let only = sup("companion-frame", SupervisorRole::ReadWrite, &factory);
    only.start().await;
    let router = TransportRouter::new(NetworkTag::Companion, only, None).unwrap();
    assert_eq!(router.select_lane(Operation::Broadcast).unwrap().name(), "companion-frame");
    assert_eq!(router.select_lane(Operation::Direct).unwrap().name(), "companion-frame");
    // The transport itself refuses what it cannot do
    assert!(router.send_direct(&target(), "x").await.is_err());
}

#[tokio::test]
async fn lane_roles_are_fixed_at_construction() {
    let a = MockFactory::new("companion-client", CLIENT_CAPS);
    let b = MockFactory::new("companion-frame", FRAME_CAPS);

    let two_readers = TransportRouter::new(
        NetworkTag::Companion,
        sup("companion-client", SupervisorRole::ReadWrite, &a),
        Some(sup("companion-frame", SupervisorRole::ReadWrite, &b)),
    );
    assert!(matches!(two_readers, Err(RoutingError::InvalidLanes { .. })));

    let send_only_reader = TransportRouter::new(
        NetworkTag::Companion,
        sup("companion-frame", SupervisorRole::SendOnly, &b),
        None,
    );
    assert!(send_only_reader.is_err());

    let wrong_network = TransportRouter::new(
        NetworkTag::Primary,
        sup("companion-client", SupervisorRole::ReadWrite, &a),
        None,
    );
    assert!(wrong_network.is_err());
}

#[tokio::test]
async fn reader_down_does_not_move_read_ownership() {
    let client_factory = MockFactory::new("companion-client", CLIENT_CAPS);
    client_factory.fail_always(Some(FailKind::Config));
    let frame_factory = MockFactory::new("companion-frame", FRAME_CAPS);
    let client = sup("companion-client", SupervisorRole::ReadWrite, &client_factory);
    let frame = sup("companion-frame", SupervisorRole::SendOnly, &frame_factory);
    client.start().await;
    frame.start().await;

    let router = TransportRouter::new(NetworkTag::Companion, client, Some(frame.clone())).unwrap();
    assert_eq!(router.read_owner().name(), "companion-client");
    assert!(!router.read_owner().is_connected());
    assert!(frame.is_connected());
    assert!(frame
        .spawn_read_loop(Arc::new(NullSink))
        .is_err());
}

struct NullSink;

#[async_trait::async_trait]
impl meshbridge::supervisor::PacketSink for NullSink {
    async fn ingest(&self, _packet: meshbridge::packet::RawPacket) {}
}
