//! The meeting session: host or participant role, replication tick, relay.
//!
//! A [`Session`] is the single owner of all meeting state. Connection tasks
//! never touch it directly; they post [`NetEvent`]s into a bounded channel
//! that [`Session::tick`] drains before doing its outbound diffing:
//!
//! ```text
//!  accept loop ──Connected──┐
//!  peer readers ──Message───┼──> mpsc ──> tick: apply, relay ──> diff scene ──> peer queues
//!              ──Closed─────┘
//! ```
//!
//! Each role gets a fresh channel, so events from connections of a previous
//! role can never leak into the next one.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use tandem_config::Config;
use tandem_coords::{Pose, RigidTransform, RoomFrame};
use tandem_net::{
    AvatarPose, ConnectOptions, Delivery, Frame, FrameConfig, IdGenerator, JoinError,
    MeetingServer, Message, NetEvent, ObjectClosed, ObjectId, ObjectOpened, ObjectPose, ObjectVisibility,
    ParticipantId, ParticipantLeft, Peer, PeerId, PeerOptions, ServerConfig, SocketConfig,
    VersionHandshake,
};
use tokio::sync::mpsc;

use crate::alignment::{AlignmentError, AlignmentStore, Hand, MarkerCapture};
use crate::avatar::{AvatarTracker, DEFAULT_STALE_AFTER};
use crate::events::SessionEvent;
use crate::registry::ObjectRegistry;
use crate::scene::Scene;

/// Capacity of the channel from connection tasks to the session.
pub const NET_EVENT_CAPACITY: usize = 1024;

/// Errors from [`Session::start_hosting`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("already hosting a meeting")]
    AlreadyHosting,

    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Runtime settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where the host listens.
    pub bind_addr: SocketAddr,
    /// Participants including the host.
    pub max_participants: usize,
    /// Connect plus handshake timeout, both when joining and accepting.
    pub connect_timeout: Duration,
    pub avatar_stale: Duration,
    pub lossy_threshold: usize,
    /// Key for persisted alignments.
    pub room_id: String,
    pub version: VersionHandshake,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: tandem_net::platform::ipv4_bind_address(tandem_net::DEFAULT_PORT),
            max_participants: 100,
            connect_timeout: Duration::from_secs(10),
            avatar_stale: DEFAULT_STALE_AFTER,
            lossy_threshold: tandem_net::DEFAULT_LOSSY_THRESHOLD,
            room_id: "default".to_string(),
            version: VersionHandshake::CURRENT,
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let ip: IpAddr = config.network.bind_address.parse().map_err(|_| {
            SessionError::InvalidConfig(format!(
                "bind_address {:?} is not an IP address",
                config.network.bind_address
            ))
        })?;
        if config.network.max_participants < 2 {
            return Err(SessionError::InvalidConfig(
                "max_participants must allow at least one guest".to_string(),
            ));
        }
        let avatar_stale = Duration::try_from_secs_f32(config.meeting.avatar_stale_seconds)
            .map_err(|e| {
                SessionError::InvalidConfig(format!("avatar_stale_seconds: {e}"))
            })?;
        Ok(Self {
            bind_addr: SocketAddr::new(ip, config.network.port),
            max_participants: config.network.max_participants as usize,
            connect_timeout: Duration::from_secs(u64::from(config.network.connect_timeout_seconds)),
            avatar_stale,
            lossy_threshold: config.meeting.lossy_queue_threshold as usize,
            room_id: config.room.room_id.clone(),
            ..Self::default()
        })
    }

    fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            lossy_threshold: self.lossy_threshold,
            frame: self.frame.clone(),
        }
    }
}

/// The local participant's tracked poses for this tick, in local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalInput {
    pub left: Pose,
    pub right: Pose,
    pub head: Pose,
}

impl Default for LocalInput {
    fn default() -> Self {
        Self {
            left: Pose::IDENTITY,
            right: Pose::IDENTITY,
            head: Pose::IDENTITY,
        }
    }
}

enum Role {
    Idle,
    Hosting {
        server: MeetingServer,
        addr: SocketAddr,
    },
    Joined {
        host: PeerId,
    },
}

/// One participant's view of a meeting.
pub struct Session<S: Scene> {
    config: SessionConfig,
    role: Role,
    participant: ParticipantId,
    peers: Vec<Peer>,
    /// Peers that still need the full object set.
    pending_full_state: Vec<PeerId>,
    registry: ObjectRegistry<S::Handle>,
    avatars: AvatarTracker,
    frame: RoomFrame,
    alignment: Option<MarkerCapture>,
    store: Box<dyn AlignmentStore + Send>,
    id_gen: Arc<IdGenerator>,
    net_rx: mpsc::Receiver<NetEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: Scene> Session<S> {
    /// Create an idle session. UI notifications arrive on the returned
    /// receiver.
    pub fn new(
        config: SessionConfig,
        store: Box<dyn AlignmentStore + Send>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (_, net_rx) = mpsc::channel(1);
        let session = Self {
            avatars: AvatarTracker::new(config.avatar_stale),
            config,
            role: Role::Idle,
            participant: ParticipantId::random(),
            peers: Vec::new(),
            pending_full_state: Vec::new(),
            registry: ObjectRegistry::new(),
            frame: RoomFrame::identity(),
            alignment: None,
            store,
            id_gen: Arc::new(IdGenerator::new()),
            net_rx,
            events,
        };
        (session, events_rx)
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant
    }

    pub fn is_hosting(&self) -> bool {
        matches!(self.role, Role::Hosting { .. })
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.role, Role::Joined { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.role, Role::Idle)
    }

    /// The address we listen on while hosting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Hosting { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn registry(&self) -> &ObjectRegistry<S::Handle> {
        &self.registry
    }

    pub fn avatars(&self) -> &AvatarTracker {
        &self.avatars
    }

    pub fn room_frame(&self) -> &RoomFrame {
        &self.frame
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Start listening for participants. Leaves a joined meeting first.
    /// Must be called within a Tokio runtime.
    pub fn start_hosting(&mut self) -> Result<SocketAddr, SessionError> {
        if self.is_hosting() {
            return Err(SessionError::AlreadyHosting);
        }
        self.leave();

        let bind_addr = self.config.bind_addr;
        let listener = tandem_net::create_listener(bind_addr, &self.config.socket)
            .map_err(|source| SessionError::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| SessionError::Bind {
            addr: bind_addr,
            source,
        })?;

        let server = MeetingServer::new(
            ServerConfig {
                max_participants: self.config.max_participants,
                handshake_timeout: self.config.connect_timeout,
                version: self.config.version,
                socket: self.config.socket.clone(),
                peer: self.config.peer_options(),
            },
            Arc::clone(&self.id_gen),
        );
        let (net_tx, net_rx) = mpsc::channel(NET_EVENT_CAPACITY);
        self.net_rx = net_rx;
        server.spawn(listener, net_tx);

        self.role = Role::Hosting { server, addr };
        self.restore_alignment();
        tracing::info!(%addr, participant = %self.participant, "hosting meeting");
        self.emit(SessionEvent::HostingStarted(addr));
        Ok(addr)
    }

    /// Stop hosting: close every participant connection and the listener.
    pub fn stop_hosting(&mut self) {
        if self.is_hosting() {
            self.leave();
        }
    }

    /// Join the meeting hosted at `addr`, leaving any current role first.
    ///
    /// Failures are also reported as [`SessionEvent::JoinFailed`].
    pub async fn join(&mut self, addr: SocketAddr) -> Result<(), JoinError> {
        self.leave();

        let options = ConnectOptions {
            timeout: self.config.connect_timeout,
            version: self.config.version,
            socket: self.config.socket.clone(),
            frame: self.config.frame.clone(),
        };
        let stream = match tandem_net::connect(addr, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "join failed");
                self.emit(SessionEvent::JoinFailed {
                    address: addr,
                    kind: e.kind(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let id = self.id_gen.next_id();
        let (reader, writer) = stream.into_split();
        let (peer, reader) = Peer::new(id, addr, reader, writer, None, &self.config.peer_options());
        let (net_tx, net_rx) = mpsc::channel(NET_EVENT_CAPACITY);
        self.net_rx = net_rx;
        reader.spawn(net_tx);

        self.peers.push(peer);
        self.pending_full_state.push(id);
        self.role = Role::Joined { host: id };
        self.restore_alignment();
        tracing::info!(%addr, participant = %self.participant, "joined meeting");
        self.emit(SessionEvent::JoinSucceeded(addr));
        Ok(())
    }

    /// Leave the current role and drop all meeting state. Local scene
    /// objects stay where they are.
    pub fn leave(&mut self) {
        let was_active = !self.is_idle();
        if let Role::Hosting { server, .. } = &self.role {
            server.shutdown();
        }
        self.role = Role::Idle;

        for peer in self.peers.drain(..) {
            peer.close();
        }
        self.pending_full_state.clear();
        self.registry.clear();
        for participant in self.avatars.clear() {
            self.emit(SessionEvent::ParticipantLeft(participant));
        }
        self.alignment = None;

        if was_active {
            tracing::info!("left meeting");
            self.emit(SessionEvent::LeftMeeting);
        }
    }

    /// Run one replication step: apply inbound traffic, then broadcast what
    /// changed in `scene` and the local avatar.
    pub fn tick(&mut self, scene: &mut S, input: &LocalInput, now: Instant) {
        self.process_network(scene, now);
        if self.is_idle() {
            return;
        }

        self.send_full_state(&*scene);

        for (id, pose) in self.registry.changed_objects(&*scene) {
            let pose = self.frame.to_room(&pose);
            self.broadcast(&Message::ObjectPose(ObjectPose { id, pose }));
        }

        for (id, shown) in self.registry.visibility_changes(&*scene) {
            self.broadcast(&Message::ObjectVisibility(ObjectVisibility { id, shown }));
        }

        self.broadcast(&Message::AvatarPose(AvatarPose {
            participant: self.participant,
            left: self.frame.to_room(&input.left),
            right: self.frame.to_room(&input.right),
            head: self.frame.to_room(&input.head),
        }));

        for (handle, id) in self.registry.opened_since_last_check(&*scene) {
            if let Some(opened) = self.object_opened(scene, handle, id) {
                tracing::info!(object = %id, name = %opened.name, bytes = opened.asset.len(), "sharing object");
                self.broadcast(&Message::ObjectOpened(opened));
            }
        }

        for id in self.registry.closed_since_last_check(&*scene) {
            tracing::debug!(object = %id, "object closed");
            self.broadcast(&Message::ObjectClosed(ObjectClosed { id }));
        }

        for change in self.avatars.refresh_visibility(now) {
            self.emit(SessionEvent::AvatarVisibility {
                participant: change.participant,
                visible: change.visible,
            });
        }
    }

    fn object_opened(&self, scene: &S, handle: S::Handle, id: ObjectId) -> Option<ObjectOpened> {
        let asset = match scene.read_asset_bytes(handle) {
            Ok(asset) => asset,
            Err(e) => {
                tracing::warn!(object = %id, error = %e, "cannot share object");
                return None;
            }
        };
        let pose = scene.pose(handle)?;
        Some(ObjectOpened {
            id,
            name: scene.object_name(handle),
            pose: self.frame.to_room(&pose),
            asset,
        })
    }

    /// Send every registered object to peers that just connected.
    fn send_full_state(&mut self, scene: &S) {
        if self.pending_full_state.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_full_state);
        // Joiners show new objects, so hidden ones need a visibility too.
        let objects: Vec<(ObjectOpened, bool)> = self
            .registry
            .iter()
            .filter_map(|object| {
                let opened = self.object_opened(scene, object.handle, object.id)?;
                Some((opened, object.snapshot.visible))
            })
            .collect();

        for peer_id in pending {
            let Some(peer) = self.peers.iter().find(|p| p.id() == peer_id) else {
                continue;
            };
            tracing::debug!(peer = %peer_id, objects = objects.len(), "sending full state");
            for (opened, visible) in &objects {
                if let Err(e) = peer.send(&Message::ObjectOpened(opened.clone())) {
                    tracing::warn!(peer = %peer_id, error = %e, "could not encode object");
                    continue;
                }
                if !visible {
                    let hidden = Message::ObjectVisibility(ObjectVisibility {
                        id: opened.id,
                        shown: false,
                    });
                    if let Err(e) = peer.send(&hidden) {
                        tracing::warn!(peer = %peer_id, error = %e, "could not encode visibility");
                    }
                }
            }
        }
    }

    fn broadcast(&self, message: &Message) {
        if self.peers.is_empty() {
            return;
        }
        let frame: Frame = match tandem_net::encode(message) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                tracing::warn!(kind = ?message.kind(), error = %e, "could not encode message");
                return;
            }
        };
        for peer in &self.peers {
            peer.enqueue(Arc::clone(&frame), message.delivery());
        }
    }

    /// Forward a received frame untouched to every peer but its sender.
    fn relay(&self, from: PeerId, frame: &Frame, delivery: Delivery) {
        for peer in self.peers.iter().filter(|p| p.id() != from) {
            peer.enqueue(Arc::clone(frame), delivery);
        }
    }

    fn process_network(&mut self, scene: &mut S, now: Instant) {
        while let Ok(event) = self.net_rx.try_recv() {
            match event {
                NetEvent::Connected(peer) => {
                    if self.is_hosting() {
                        tracing::info!(peer = %peer.id(), addr = %peer.addr(), "participant joined");
                        self.pending_full_state.push(peer.id());
                        self.peers.push(peer);
                    } else {
                        peer.close();
                    }
                }
                NetEvent::Message {
                    peer,
                    message,
                    frame,
                } => {
                    if !self.peers.iter().any(|p| p.id() == peer) {
                        continue;
                    }
                    let delivery = message.delivery();
                    let relayed = message.is_relayed();
                    self.handle_message(scene, peer, message, now);
                    if self.is_hosting() && relayed {
                        self.relay(peer, &frame, delivery);
                    }
                }
                NetEvent::Closed { peer, reason } => self.remove_peer(peer, &reason.to_string()),
            }
        }
    }

    fn handle_message(&mut self, scene: &mut S, from: PeerId, message: Message, now: Instant) {
        match message {
            Message::ObjectPose(m) => {
                let pose = self.frame.from_room(&m.pose);
                if !self.registry.apply_remote_pose(scene, m.id, pose) {
                    tracing::debug!(object = %m.id, "pose for unknown object ignored");
                }
            }
            Message::ObjectVisibility(m) => {
                if !self.registry.apply_remote_visibility(scene, m.id, m.shown) {
                    tracing::debug!(object = %m.id, "visibility for unknown object ignored");
                }
            }
            Message::AvatarPose(m) => {
                if m.participant == self.participant {
                    return;
                }
                // On the host each connection carries exactly one participant.
                if self.is_hosting()
                    && let Some(peer) = self.peers.iter_mut().find(|p| p.id() == from)
                    && peer.participant().is_none()
                {
                    peer.set_participant(m.participant);
                }
                let change = self.avatars.update(
                    m.participant,
                    self.frame.from_room(&m.left),
                    self.frame.from_room(&m.right),
                    self.frame.from_room(&m.head),
                    now,
                );
                if let Some(change) = change {
                    self.emit(SessionEvent::AvatarVisibility {
                        participant: change.participant,
                        visible: change.visible,
                    });
                }
            }
            Message::ObjectOpened(mut m) => {
                m.pose = self.frame.from_room(&m.pose);
                match self.registry.apply_remote_open(scene, &m) {
                    Ok(Some(_)) => {
                        tracing::info!(object = %m.id, name = %m.name, "received object")
                    }
                    Ok(None) => tracing::debug!(object = %m.id, "object already known"),
                    Err(e) => tracing::warn!(object = %m.id, error = %e, "could not open object"),
                }
            }
            Message::ObjectClosed(m) => {
                if !self.registry.apply_remote_close(scene, m.id) {
                    tracing::debug!(object = %m.id, "close for unknown object ignored");
                }
            }
            Message::ParticipantLeft(m) => {
                if self.avatars.remove(m.participant) {
                    self.emit(SessionEvent::ParticipantLeft(m.participant));
                }
            }
            Message::Error(notice) => {
                tracing::warn!(peer = %from, "peer reported: {}", notice.text);
                self.emit(SessionEvent::Error(notice.text));
            }
            Message::VersionHandshake(_) => {
                tracing::debug!(peer = %from, "late version handshake ignored");
            }
        }
    }

    fn remove_peer(&mut self, id: PeerId, reason: &str) {
        let Some(index) = self.peers.iter().position(|p| p.id() == id) else {
            return;
        };
        let peer = self.peers.remove(index);
        peer.close();
        self.pending_full_state.retain(|p| *p != id);
        tracing::info!(peer = %id, %reason, "connection ended");

        if let Role::Joined { host } = self.role
            && host == id
        {
            self.emit(SessionEvent::Error(format!("Lost connection to the host: {reason}")));
            self.leave();
            return;
        }

        if let Some(participant) = peer.participant() {
            self.avatars.remove(participant);
            self.emit(SessionEvent::ParticipantLeft(participant));
            if self.is_hosting() {
                self.broadcast(&Message::ParticipantLeft(ParticipantLeft { participant }));
            }
        }
    }

    fn restore_alignment(&mut self) {
        match self.store.load_room_alignment(&self.config.room_id) {
            Ok(Some((x1, x2))) => match RoomFrame::from_markers(x1, x2) {
                Ok(frame) => {
                    tracing::info!(room = %self.config.room_id, "restored room alignment");
                    self.frame = frame;
                }
                Err(e) => tracing::warn!(room = %self.config.room_id, error = %e, "stored alignment unusable"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(room = %self.config.room_id, error = %e, "could not load room alignment"),
        }
    }

    /// Start placing room markers. Host only.
    pub fn begin_alignment(&mut self) -> Result<(), AlignmentError> {
        if !self.is_hosting() {
            return Err(AlignmentError::NotHost);
        }
        self.alignment = Some(MarkerCapture::starting_from(self.frame.markers()));
        Ok(())
    }

    pub fn end_alignment(&mut self) {
        self.alignment = None;
    }

    pub fn is_aligning(&self) -> bool {
        self.alignment.is_some()
    }

    /// Drop `hand`'s marker at `position` (local space).
    ///
    /// Once both markers are placed, the room frame is re-captured, every
    /// object and avatar is moved so its room pose is unchanged, and the
    /// markers are saved for this room. Returns the applied motion.
    pub fn drop_marker(
        &mut self,
        hand: Hand,
        position: Vec3,
        scene: &mut S,
    ) -> Result<Option<RigidTransform>, AlignmentError> {
        let capture = self.alignment.as_mut().ok_or(AlignmentError::NotActive)?;
        capture.drop_marker(hand, position);
        let Some((x1, x2)) = capture.markers() else {
            return Ok(None);
        };

        let motion = self.frame.capture(x1, x2)?;
        self.registry.relocate_all(scene, &motion);
        self.avatars.apply_motion(&motion);

        if let Err(e) = self.store.save_room_alignment(&self.config.room_id, x1, x2) {
            tracing::warn!(room = %self.config.room_id, error = %e, "could not save room alignment");
        }
        tracing::info!(room = %self.config.room_id, "room alignment captured");
        Ok(Some(motion))
    }
}
