//! End-to-end meetings over loopback TCP.
//!
//! Hosts are real [`Session`]s. Participants are either sessions too or raw
//! protocol clients that read and write frames directly, which lets a test
//! assert exactly what went over the wire.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use tandem_coords::Pose;
use tandem_meeting::{
    AlignmentError, Hand, LocalInput, MemoryAlignmentStore, MemoryScene, Scene, Session,
    SessionConfig, SessionEvent,
};
use tandem_net::{
    AvatarPose, ConnectOptions, FrameConfig, JoinError, JoinFailureKind, Message, ObjectId,
    ObjectOpened, ObjectPose, ParticipantId, ParticipantLeft, VersionHandshake,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

const DEADLINE: Duration = Duration::from_secs(5);

fn loopback_config() -> SessionConfig {
    SessionConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..SessionConfig::default()
    }
}

fn new_session(
    config: SessionConfig,
    store: &MemoryAlignmentStore,
) -> (Session<MemoryScene>, UnboundedReceiver<SessionEvent>) {
    Session::new(config, Box::new(store.clone()))
}

/// Run `step` every 10ms until it returns true.
async fn until(mut step: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !step() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn tick(session: &mut Session<MemoryScene>, scene: &mut MemoryScene) {
    session.tick(scene, &LocalInput::default(), Instant::now());
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn posed(x: f32, yaw: f32) -> Pose {
    Pose::new(Vec3::new(x, 1.0, -0.5), Quat::from_rotation_y(yaw), 1.5)
}

/// A participant speaking the wire protocol by hand.
struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    async fn join(addr: SocketAddr) -> Self {
        let stream = tandem_net::connect(addr, &ConnectOptions::default())
            .await
            .unwrap();
        Self { stream }
    }

    async fn send(&mut self, message: &Message) {
        let frame = tandem_net::encode(message).unwrap();
        self.stream.write_all(&frame).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Next message that is not an avatar update.
    async fn next_event(&mut self) -> Message {
        tokio::time::timeout(DEADLINE, async {
            loop {
                let body = tandem_net::read_frame(&mut self.stream, &FrameConfig::default())
                    .await
                    .unwrap();
                match tandem_net::decode_body(&body).unwrap() {
                    Message::AvatarPose(_) => continue,
                    other => return other,
                }
            }
        })
        .await
        .expect("no message from host")
    }
}

async fn host_with_client() -> (
    Session<MemoryScene>,
    UnboundedReceiver<SessionEvent>,
    MemoryScene,
    RawClient,
) {
    let store = MemoryAlignmentStore::new();
    let (mut host, events) = new_session(loopback_config(), &store);
    let addr = host.start_hosting().unwrap();
    let mut scene = MemoryScene::new();

    let client = RawClient::join(addr).await;
    until(|| {
        tick(&mut host, &mut scene);
        host.peer_count() == 1
    })
    .await;
    (host, events, scene, client)
}

#[tokio::test]
async fn test_cube_open_move_close_reaches_participant() {
    let (mut host, _events, mut scene, mut client) = host_with_client().await;

    let cube = scene.open("cube.glb", b"glTF cube bytes".to_vec());
    tick(&mut host, &mut scene);
    let Message::ObjectOpened(opened) = client.next_event().await else {
        panic!("expected the cube to be opened");
    };
    assert_eq!(opened.name, "cube.glb");
    assert_eq!(opened.asset, b"glTF cube bytes");
    assert_eq!(opened.pose, Pose::IDENTITY);
    assert_eq!(host.registry().id_of(cube), Some(opened.id));

    scene.set_pose(cube, posed(2.0, 0.5));
    tick(&mut host, &mut scene);
    tick(&mut host, &mut scene);
    let Message::ObjectPose(moved) = client.next_event().await else {
        panic!("expected a pose update");
    };
    assert_eq!(moved.id, opened.id);
    assert!(moved.pose.approx_eq(&posed(2.0, 0.5), 1e-6));

    // An unchanged tick sends nothing, so the next event is the close.
    scene.close(cube);
    tick(&mut host, &mut scene);
    assert_eq!(
        client.next_event().await,
        Message::ObjectClosed(tandem_net::ObjectClosed { id: opened.id })
    );
    assert!(host.registry().is_empty());
}

#[tokio::test]
async fn test_remote_changes_apply_without_echo() {
    let (mut host, _events, mut scene, mut client) = host_with_client().await;

    let sphere = ObjectOpened {
        id: ObjectId(0x5ee),
        name: "sphere.glb".to_string(),
        pose: posed(1.0, 0.0),
        asset: vec![7; 64],
    };
    client.send(&Message::ObjectOpened(sphere.clone())).await;
    until(|| {
        tick(&mut host, &mut scene);
        scene.find("sphere.glb").is_some()
    })
    .await;
    let handle = scene.find("sphere.glb").unwrap();
    assert_eq!(scene.asset(handle), Some(&[7u8; 64][..]));
    assert!(scene.pose(handle).unwrap().approx_eq(&posed(1.0, 0.0), 1e-6));

    client
        .send(&Message::ObjectPose(ObjectPose {
            id: sphere.id,
            pose: posed(-3.0, 1.0),
        }))
        .await;
    until(|| {
        tick(&mut host, &mut scene);
        scene.pose(handle).unwrap().approx_eq(&posed(-3.0, 1.0), 1e-6)
    })
    .await;

    // Neither the open nor the move comes back; the first thing the client
    // hears is the host's own object.
    tick(&mut host, &mut scene);
    scene.open("host.glb", vec![1, 2, 3]);
    tick(&mut host, &mut scene);
    let Message::ObjectOpened(opened) = client.next_event().await else {
        panic!("expected the host's object");
    };
    assert_eq!(opened.name, "host.glb");

    // Closing remotely, then a stray late pose for the closed id.
    client
        .send(&Message::ObjectClosed(tandem_net::ObjectClosed { id: sphere.id }))
        .await;
    client
        .send(&Message::ObjectPose(ObjectPose {
            id: sphere.id,
            pose: posed(9.0, 0.0),
        }))
        .await;
    until(|| {
        tick(&mut host, &mut scene);
        scene.find("sphere.glb").is_none()
    })
    .await;
    for _ in 0..5 {
        tick(&mut host, &mut scene);
    }
    assert_eq!(scene.len(), 1);
    assert_eq!(host.registry().len(), 1);
    assert!(host.registry().was_issued(sphere.id));
}

#[tokio::test]
async fn test_host_relays_between_participants() {
    let store = MemoryAlignmentStore::new();
    let (mut host, mut events) = new_session(loopback_config(), &store);
    let addr = host.start_hosting().unwrap();
    let mut scene = MemoryScene::new();

    let mut b = RawClient::join(addr).await;
    let mut c = RawClient::join(addr).await;
    until(|| {
        tick(&mut host, &mut scene);
        host.peer_count() == 2
    })
    .await;

    let from_b = ObjectOpened {
        id: ObjectId(0xb0b),
        name: "b.glb".to_string(),
        pose: posed(0.5, 0.25),
        asset: b"from b".to_vec(),
    };
    b.send(&Message::ObjectOpened(from_b.clone())).await;
    until(|| {
        tick(&mut host, &mut scene);
        scene.find("b.glb").is_some()
    })
    .await;
    assert_eq!(c.next_event().await, Message::ObjectOpened(from_b));

    // B never hears its own object back.
    scene.open("host.glb", vec![0; 16]);
    tick(&mut host, &mut scene);
    let Message::ObjectOpened(opened) = b.next_event().await else {
        panic!("expected the host's object");
    };
    assert_eq!(opened.name, "host.glb");

    let b_participant = ParticipantId(77);
    b.send(&Message::AvatarPose(AvatarPose {
        participant: b_participant,
        left: Pose::IDENTITY,
        right: Pose::IDENTITY,
        head: Pose::from_position(Vec3::Y),
    }))
    .await;
    until(|| {
        tick(&mut host, &mut scene);
        host.avatars().get(b_participant).is_some()
    })
    .await;

    drop(b);
    until(|| {
        tick(&mut host, &mut scene);
        host.peer_count() == 1
    })
    .await;

    // C already has the host's object queued ahead of the departure.
    let Message::ObjectOpened(_) = c.next_event().await else {
        panic!("expected the host's object");
    };
    assert_eq!(
        c.next_event().await,
        Message::ParticipantLeft(ParticipantLeft {
            participant: b_participant
        })
    );
    assert!(host.avatars().get(b_participant).is_none());
    assert!(drain(&mut events).contains(&SessionEvent::ParticipantLeft(b_participant)));
}

#[tokio::test]
async fn test_sessions_exchange_full_state() {
    let store = MemoryAlignmentStore::new();
    let (mut host, mut host_events) = new_session(loopback_config(), &store);
    let mut host_scene = MemoryScene::new();
    let a = host_scene.open("a.glb", b"host model".to_vec());
    host_scene.set_pose(a, posed(1.0, 0.0));

    let addr = host.start_hosting().unwrap();
    tick(&mut host, &mut host_scene);
    assert_eq!(host.registry().len(), 1);

    let (mut guest, mut guest_events) = new_session(loopback_config(), &store);
    let mut guest_scene = MemoryScene::new();
    guest_scene.open("b.glb", b"guest model".to_vec());
    guest.join(addr).await.unwrap();
    assert!(guest.is_joined());
    assert_eq!(
        guest.begin_alignment(),
        Err(AlignmentError::NotHost),
        "only the host aligns"
    );

    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        host_scene.find("b.glb").is_some() && guest_scene.find("a.glb").is_some()
    })
    .await;
    let a_on_guest = guest_scene.find("a.glb").unwrap();
    assert_eq!(guest_scene.asset(a_on_guest), Some(&b"host model"[..]));
    assert!(guest_scene.pose(a_on_guest).unwrap().approx_eq(&posed(1.0, 0.0), 1e-5));

    host_scene.set_pose(a, posed(4.0, 2.0));
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene.pose(a_on_guest).unwrap().approx_eq(&posed(4.0, 2.0), 1e-5)
    })
    .await;

    let guest_id = guest.participant_id();
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        host.avatars().get(guest_id).is_some()
    })
    .await;

    guest.leave();
    assert!(drain(&mut guest_events).contains(&SessionEvent::LeftMeeting));
    until(|| {
        tick(&mut host, &mut host_scene);
        host.peer_count() == 0
    })
    .await;
    assert!(drain(&mut host_events).contains(&SessionEvent::ParticipantLeft(guest_id)));
    assert_eq!(guest_scene.len(), 2, "leaving keeps local objects");
}

#[tokio::test]
async fn test_rejoining_guest_gets_objects_again() {
    let store = MemoryAlignmentStore::new();
    let (mut host, _host_events) = new_session(loopback_config(), &store);
    let mut host_scene = MemoryScene::new();
    let cube = host_scene.open("cube.glb", b"cube".to_vec());
    let addr = host.start_hosting().unwrap();

    let (mut guest, _guest_events) = new_session(loopback_config(), &store);
    let mut guest_scene = MemoryScene::new();
    guest.join(addr).await.unwrap();
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene.find("cube.glb").is_some()
    })
    .await;

    guest.leave();
    let stale = guest_scene.find("cube.glb").unwrap();
    guest_scene.close(stale);
    until(|| {
        tick(&mut host, &mut host_scene);
        host.peer_count() == 0
    })
    .await;

    guest.join(addr).await.unwrap();
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene.find("cube.glb").is_some()
    })
    .await;
    assert_eq!(guest.registry().len(), 1);

    // Later updates for the same id still land.
    let on_guest = guest_scene.find("cube.glb").unwrap();
    host_scene.set_pose(cube, posed(3.0, 1.0));
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene.pose(on_guest).unwrap().approx_eq(&posed(3.0, 1.0), 1e-5)
    })
    .await;
    host_scene.close(cube);
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_sees_hidden_objects_hidden() {
    let store = MemoryAlignmentStore::new();
    let (mut host, _host_events) = new_session(loopback_config(), &store);
    let mut host_scene = MemoryScene::new();
    let addr = host.start_hosting().unwrap();
    let cube = host_scene.open("cube.glb", b"cube".to_vec());
    host_scene.open("lamp.glb", b"lamp".to_vec());
    tick(&mut host, &mut host_scene);
    host_scene.set_visible(cube, false);
    tick(&mut host, &mut host_scene);

    let (mut guest, _guest_events) = new_session(loopback_config(), &store);
    let mut guest_scene = MemoryScene::new();
    guest.join(addr).await.unwrap();
    until(|| {
        tick(&mut host, &mut host_scene);
        tick(&mut guest, &mut guest_scene);
        guest_scene
            .find("cube.glb")
            .is_some_and(|h| !guest_scene.is_visible(h))
    })
    .await;
    let lamp = guest_scene.find("lamp.glb").unwrap();
    assert!(guest_scene.is_visible(lamp));
}

#[tokio::test]
async fn test_guest_leaves_when_host_stops() {
    let store = MemoryAlignmentStore::new();
    let (mut host, _host_events) = new_session(loopback_config(), &store);
    let mut host_scene = MemoryScene::new();
    let addr = host.start_hosting().unwrap();

    let (mut guest, mut guest_events) = new_session(loopback_config(), &store);
    let mut guest_scene = MemoryScene::new();
    guest.join(addr).await.unwrap();
    until(|| {
        tick(&mut host, &mut host_scene);
        host.peer_count() == 1
    })
    .await;

    host.stop_hosting();
    until(|| {
        tick(&mut guest, &mut guest_scene);
        guest.is_idle()
    })
    .await;
    let events = drain(&mut guest_events);
    assert!(events.contains(&SessionEvent::LeftMeeting));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
}

#[tokio::test]
async fn test_full_meeting_rejects_join() {
    let store = MemoryAlignmentStore::new();
    let config = SessionConfig {
        max_participants: 2,
        ..loopback_config()
    };
    let (mut host, _events) = new_session(config, &store);
    let addr = host.start_hosting().unwrap();
    let mut scene = MemoryScene::new();

    let _first = RawClient::join(addr).await;
    until(|| {
        tick(&mut host, &mut scene);
        host.peer_count() == 1
    })
    .await;

    let (mut late, mut late_events) = new_session(loopback_config(), &store);
    let err = late.join(addr).await.unwrap_err();
    assert_eq!(err.kind(), JoinFailureKind::Rejected);
    assert!(
        matches!(&err, JoinError::Rejected(text) if text.contains("only allow 2 participants")),
        "{err}"
    );
    assert!(late.is_idle());
    assert!(matches!(
        late_events.try_recv(),
        Ok(SessionEvent::JoinFailed {
            kind: JoinFailureKind::Rejected,
            ..
        })
    ));
}

#[tokio::test]
async fn test_old_client_cannot_join() {
    let store = MemoryAlignmentStore::new();
    let (mut host, _events) = new_session(loopback_config(), &store);
    let addr = host.start_hosting().unwrap();

    let old = SessionConfig {
        version: VersionHandshake {
            version: 9,
            minimum_compatible: 9,
        },
        ..loopback_config()
    };
    let (mut guest, _guest_events) = new_session(old, &store);
    let err = guest.join(addr).await.unwrap_err();
    assert!(
        matches!(
            err,
            JoinError::ClientTooOld {
                local: 9,
                required: 10
            }
        ),
        "{err}"
    );
    assert_eq!(err.kind(), JoinFailureKind::IncompatibleVersion);
}

#[tokio::test]
async fn test_join_unreachable_address() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = MemoryAlignmentStore::new();
    let (mut guest, mut events) = new_session(loopback_config(), &store);
    let err = guest.join(addr).await.unwrap_err();
    assert_eq!(err.kind(), JoinFailureKind::Unreachable);
    assert!(matches!(
        events.try_recv(),
        Ok(SessionEvent::JoinFailed { address, .. }) if address == addr
    ));
}

#[tokio::test]
async fn test_alignment_keeps_room_poses_and_persists() {
    let store = MemoryAlignmentStore::new();
    let config = SessionConfig {
        room_id: "lab".to_string(),
        ..loopback_config()
    };
    let (mut host, _events) = new_session(config.clone(), &store);
    let addr = host.start_hosting().unwrap();
    let mut scene = MemoryScene::new();
    let mut client = RawClient::join(addr).await;
    until(|| {
        tick(&mut host, &mut scene);
        host.peer_count() == 1
    })
    .await;

    let cube = scene.open("cube.glb", vec![3; 8]);
    scene.set_pose(cube, posed(1.0, 0.3));
    tick(&mut host, &mut scene);
    let Message::ObjectOpened(opened) = client.next_event().await else {
        panic!("expected the cube");
    };
    let room_before = host.room_frame().to_room(&scene.pose(cube).unwrap());

    host.begin_alignment().unwrap();
    let x1 = Vec3::new(2.0, 0.0, 1.0);
    let x2 = Vec3::new(2.0, 0.0, -1.0);
    assert_eq!(host.drop_marker(Hand::Right, x1, &mut scene), Ok(None));
    let motion = host.drop_marker(Hand::Left, x2, &mut scene).unwrap();
    assert!(motion.is_some());

    let local_after = scene.pose(cube).unwrap();
    assert!(!local_after.approx_eq(&posed(1.0, 0.3), 1e-3), "object moved locally");
    let room_after = host.room_frame().to_room(&local_after);
    assert!(room_after.approx_eq(&room_before, 1e-4));
    assert_eq!(store.get("lab"), Some((x1, x2)));

    // The relocation is not a change anyone else needs to hear about.
    tick(&mut host, &mut scene);
    scene.close(cube);
    tick(&mut host, &mut scene);
    assert_eq!(
        client.next_event().await,
        Message::ObjectClosed(tandem_net::ObjectClosed { id: opened.id })
    );

    host.end_alignment();
    assert!(!host.is_aligning());
    assert_eq!(
        host.drop_marker(Hand::Left, Vec3::ZERO, &mut scene),
        Err(AlignmentError::NotActive)
    );
    host.stop_hosting();

    let (mut next_host, _next_events) = new_session(config, &store);
    next_host.start_hosting().unwrap();
    assert_eq!(next_host.room_frame().markers(), Some((x1, x2)));
}
