//! Per-connection state machine for the reliable stream.
//!
//! Each accepted stream gets one [`Connection`] and two tasks: a receive loop
//! that parses frames strictly in order, and a send loop that drains a
//! bounded queue into the socket. Everything else talks to the connection
//! through [`Connection::send`], which never waits.
//!
//! The state is not stored; it is derived from monotonic flags so that
//! concurrent readers (tick loop, datagram task, deferred timers) can check it
//! without locking:
//!
//! ```text
//! AwaitingHandshake -> ChecksumPending -> SlotBound -> Spawned
//!         |                  |               |           |
//!         v                  +-------+-------+-----------+
//!      Rejected                      v
//!         |                       Closing -> Closed
//!         +-----------------------> ^
//! ```
//!
//! Disconnect may be requested from anywhere (peer error, kick, timers, the
//! high-ping detector). The first request wins; later ones are no-ops.

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::events::{ChecksumVerdict, EventFlow, LapCompletedEvent, LifecycleEvent};
use crate::handshake;
use crate::slots::{ClientSlot, EntryCar, SlotId};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shared::framing::{read_frame, write_frame, FrameConfig};
use shared::handshake::HandshakeRequest;
use shared::packets::{
    CarConnected, CarDisconnected, CarListEntry, CarListRequest, CarListResponse, ChatMessage,
    DamageUpdate, DamageUpdateIn, LapCompletedIn, LapCompletedOut, SpectateCar,
    TyreCompoundChange, TyreCompoundUpdate, WelcomeMessage, CAR_LIST_PAGE_SIZE,
};
use shared::{
    to_bytes, Decode, Encode, ExtendedTcpId, PacketId, PacketReader, PositionUpdateIn,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Minimum gap between two chat messages from one connection.
pub const CHAT_RATE_LIMIT_MS: i64 = 1_000;

/// How long a closing connection may take to flush its queue.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Rejected,
    /// Slot bound, checksum not verified yet.
    ChecksumPending,
    SlotBound,
    Spawned,
    Closing,
    Closed,
}

/// Who is on the other end, fixed once the handshake is accepted.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub team: String,
    pub nation: String,
    pub guid: u64,
    /// Hex SHA-256 of the guid, safe to expose to other players.
    pub hashed_guid: String,
    /// Account that owns the game licence, when it differs from `guid`.
    pub owner_guid: Option<u64>,
    /// One-shot token for authenticating against side services.
    pub api_token: String,
    pub features: Vec<String>,
}

impl ClientIdentity {
    pub fn new(name: String, team: String, nation: String, guid: u64, features: Vec<String>) -> Self {
        Self {
            name,
            team,
            nation,
            guid,
            hashed_guid: hash_guid(guid),
            owner_guid: None,
            api_token: new_api_token(),
            features,
        }
    }
}

pub fn hash_guid(guid: u64) -> String {
    format!("{:x}", Sha256::digest(guid.to_string().as_bytes()))
}

fn new_api_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

pub struct Connection {
    ctx: Arc<ServerContext>,
    me: Weak<Connection>,
    id: u64,
    peer: Option<SocketAddr>,
    identity: OnceLock<ClientIdentity>,
    slot: OnceLock<SlotId>,
    udp_addr: OnceLock<SocketAddr>,

    disconnect_requested: AtomicBool,
    closed: AtomicBool,
    rejected: AtomicBool,
    is_admin: AtomicBool,
    supports_custom_update: AtomicBool,
    received_first_position: AtomicBool,
    has_passed_checksum: AtomicBool,
    has_sent_first_update: AtomicBool,
    security_level: AtomicI32,
    last_chat: AtomicI64,

    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Receiving end of the queue until the send loop claims it.
    pending_outbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
    cancel: watch::Sender<bool>,
}

impl Connection {
    pub fn new(ctx: &Arc<ServerContext>, peer: Option<SocketAddr>) -> Arc<Self> {
        let capacity = ctx.config().extra.outbound_queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (cancel, _) = watch::channel(false);

        Arc::new_cyclic(|me| Self {
            ctx: Arc::clone(ctx),
            me: me.clone(),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            identity: OnceLock::new(),
            slot: OnceLock::new(),
            udp_addr: OnceLock::new(),
            disconnect_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            is_admin: AtomicBool::new(false),
            supports_custom_update: AtomicBool::new(false),
            received_first_position: AtomicBool::new(false),
            has_passed_checksum: AtomicBool::new(false),
            has_sent_first_update: AtomicBool::new(false),
            security_level: AtomicI32::new(0),
            last_chat: AtomicI64::new(i64::MIN),
            outbound: Mutex::new(Some(tx)),
            pending_outbound: Mutex::new(Some(rx)),
            send_task: Mutex::new(None),
            cancel,
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(ctx: &Arc<ServerContext>) -> Arc<Self> {
        Self::new(ctx, None)
    }

    #[cfg(test)]
    pub(crate) fn set_identity_for_tests(&self, guid: u64, name: &str) {
        self.set_identity(ClientIdentity::new(
            name.to_string(),
            String::new(),
            "ITA".to_string(),
            guid,
            Vec::new(),
        ));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.get()
    }

    pub fn name(&self) -> &str {
        self.identity.get().map_or("<unknown>", |identity| identity.name.as_str())
    }

    pub fn guid(&self) -> Option<u64> {
        self.identity.get().map(|identity| identity.guid)
    }

    pub fn slot_id(&self) -> Option<SlotId> {
        self.slot.get().copied()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr.get().copied()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin.load(Ordering::Acquire)
    }

    pub fn supports_custom_update(&self) -> bool {
        self.supports_custom_update.load(Ordering::Acquire)
    }

    pub fn has_passed_checksum(&self) -> bool {
        self.has_passed_checksum.load(Ordering::Acquire)
    }

    pub fn has_received_first_position(&self) -> bool {
        self.received_first_position.load(Ordering::Acquire)
    }

    pub fn has_sent_first_update(&self) -> bool {
        self.has_sent_first_update.load(Ordering::Acquire)
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    pub fn security_level(&self) -> i32 {
        self.security_level.load(Ordering::Acquire)
    }

    /// Set by anti-cheat collaborators, usually from a handshake observer.
    pub fn set_security_level(&self, level: i32) {
        self.security_level.store(level, Ordering::Release);
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else if self.is_disconnect_requested() {
            ConnectionState::Closing
        } else if self.slot_id().is_none() {
            if self.rejected.load(Ordering::Acquire) {
                ConnectionState::Rejected
            } else {
                ConnectionState::AwaitingHandshake
            }
        } else if self.has_sent_first_update() {
            ConnectionState::Spawned
        } else if self.has_passed_checksum() {
            ConnectionState::SlotBound
        } else {
            ConnectionState::ChecksumPending
        }
    }

    /// Records the slot chosen by the registry. Returns false if one is
    /// already recorded.
    pub(crate) fn assign_slot(&self, slot_id: SlotId) -> bool {
        self.slot.set(slot_id).is_ok()
    }

    pub(crate) fn set_identity(&self, identity: ClientIdentity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub(crate) fn set_admin(&self, is_admin: bool) {
        self.is_admin.store(is_admin, Ordering::Release);
    }

    pub(crate) fn set_custom_update(&self, enabled: bool) {
        self.supports_custom_update.store(enabled, Ordering::Release);
    }

    pub(crate) fn mark_checksum_passed(&self) {
        self.has_passed_checksum.store(true, Ordering::Release);
    }

    pub(crate) fn mark_first_update_sent(&self) {
        self.has_sent_first_update.store(true, Ordering::Release);
    }

    /// Binds the datagram endpoint. Only the first address sticks.
    pub(crate) fn bind_udp(&self, addr: SocketAddr) -> bool {
        self.udp_addr.set(addr).is_ok()
    }

    /// Hands out the receiving end of the outbound queue, once.
    pub(crate) fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.pending_outbound.lock().take()
    }

    fn client_slot(&self) -> Option<&ClientSlot> {
        self.ctx.slots().client(self.slot_id()?)
    }

    fn describe(&self) -> String {
        match (self.identity.get(), self.peer) {
            (Some(identity), _) => identity.name.clone(),
            (None, Some(peer)) => peer.to_string(),
            (None, None) => format!("connection #{}", self.id),
        }
    }

    /// Queues a packet on the reliable channel.
    ///
    /// Never waits. When the queue is full a droppable packet is discarded and
    /// anything else disconnects the connection. Returns whether the packet
    /// was queued.
    pub fn send<P: Encode + ?Sized>(&self, packet: &P) -> bool {
        match to_bytes(packet) {
            Ok(bytes) => self.send_bytes(bytes, packet.is_droppable()),
            Err(e) => {
                warn!("Failed to encode packet for {}: {}", self.describe(), e);
                false
            }
        }
    }

    /// Queues an already encoded packet.
    pub fn send_bytes(&self, bytes: Vec<u8>, droppable: bool) -> bool {
        let result = {
            let outbound = self.outbound.lock();
            let Some(sender) = outbound.as_ref() else {
                return false;
            };
            sender.try_send(bytes)
        };

        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) if droppable => {
                trace!("Outbound queue of {} full, dropped low priority packet", self.describe());
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of {} is full, disconnecting", self.describe());
                self.begin_disconnect();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Sends a packet on the datagram channel, if an endpoint is bound.
    pub fn send_datagram<P: Encode + ?Sized>(&self, packet: &P) {
        let Some(addr) = self.udp_addr() else {
            return;
        };
        match to_bytes(packet) {
            Ok(bytes) => self.ctx.send_datagram_to(addr, &bytes),
            Err(e) => warn!("Failed to encode datagram for {}: {}", self.describe(), e),
        }
    }

    /// Requests disconnect. Idempotent.
    ///
    /// Inbound processing stops at once and nothing more can be queued. The
    /// already queued packets are flushed (bounded by a timeout) before the
    /// slot is released.
    pub fn begin_disconnect(&self) {
        if self
            .disconnect_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.cancel.send_replace(true);
        self.outbound.lock().take();

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let send_task = self.send_task.lock().take();
        match (send_task, tokio::runtime::Handle::try_current()) {
            (Some(task), Ok(runtime)) => {
                runtime.spawn(async move {
                    me.drain(task).await;
                    me.finish_disconnect();
                });
            }
            (Some(task), Err(_)) => {
                task.abort();
                me.finish_disconnect();
            }
            (None, _) => me.finish_disconnect(),
        }
    }

    async fn drain(&self, mut task: JoinHandle<()>) {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            debug!("Outbound queue of {} did not drain in time", self.describe());
            task.abort();
        }
    }

    fn finish_disconnect(self: &Arc<Self>) {
        let ctx = &self.ctx;
        if self.slot_id().is_some() {
            ctx.events().lifecycle(self, LifecycleEvent::Disconnected);
        }

        let released = ctx.slots().release_slot(self);
        if let Some(addr) = self.udp_addr() {
            ctx.endpoints().remove(&addr);
        }
        if let (true, true, Some(slot_id)) = (released, self.has_passed_checksum(), self.slot_id()) {
            ctx.broadcast(&CarDisconnected { slot_id }, Some(self));
        }

        self.closed.store(true, Ordering::Release);
        info!("{} disconnected", self.describe());
    }

    /// Runs both loops for an accepted stream until the connection closes.
    pub async fn serve(self: Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", self.describe(), e);
        }
        let (reader, writer) = stream.into_split();

        if let Some(queue) = self.take_outbound() {
            let task = tokio::spawn(send_loop(writer, queue, self.id));
            *self.send_task.lock() = Some(task);
        }

        self.receive_loop(reader).await;
        self.begin_disconnect();
    }

    async fn receive_loop(self: &Arc<Self>, mut reader: OwnedReadHalf) {
        let config = FrameConfig::default();
        let mut cancel = self.cancel.subscribe();

        loop {
            if *cancel.borrow() {
                break;
            }
            let frame = tokio::select! {
                _ = cancel.changed() => break,
                frame = read_frame(&mut reader, &config) => frame,
            };

            let result = match frame {
                Ok(frame) => self.handle_frame(&frame),
                Err(e) => Err(ServerError::from(e)),
            };
            if let Err(e) = result {
                self.on_error(e);
                break;
            }
        }
    }

    fn on_error(self: &Arc<Self>, error: ServerError) {
        match &error {
            e if e.is_disconnect() => debug!("{} closed the stream", self.describe()),
            ServerError::AuthenticationFailure(rejection) => {
                info!("Rejected {}: {:?}", self.describe(), rejection)
            }
            ServerError::ChecksumFailure => {}
            e if e.is_protocol_violation() => {
                warn!("Protocol violation from {}: {}", self.describe(), e)
            }
            ServerError::Transport(_) | ServerError::Frame(_) => {
                error!("Transport error on {}: {}", self.describe(), error);
                if self.has_sent_first_update() {
                    self.ctx.kick(self, shared::KickReason::Kicked, "a connection error", None);
                }
            }
            e => warn!("Closing {}: {}", self.describe(), e),
        }
        self.begin_disconnect();
    }

    /// Dispatches one reliable frame on its tag byte.
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: &[u8]) -> Result<(), ServerError> {
        let mut reader = PacketReader::new(frame);
        let tag = reader.read_u8()?;

        if self.is_disconnect_requested() {
            return Ok(());
        }
        if self.slot_id().is_none() {
            return if tag == u8::from(PacketId::RequestNewConnection) {
                self.handle_handshake(&mut reader)
            } else {
                Err(ServerError::UnexpectedPacket {
                    tag,
                    state: "awaiting handshake",
                })
            };
        }

        let Ok(id) = PacketId::try_from(tag) else {
            debug!("Unknown packet 0x{:02X} from {}", tag, self.describe());
            return Ok(());
        };
        match id {
            PacketId::Checksum => self.handle_checksum(reader.rest()),
            PacketId::Chat => self.handle_chat(ChatMessage::decode(&mut reader)?),
            PacketId::DamageUpdate => self.handle_damage(DamageUpdateIn::decode(&mut reader)?),
            PacketId::TyreCompoundChange => {
                self.handle_tyre_change(TyreCompoundChange::decode(&mut reader)?)
            }
            PacketId::LapCompleted => self.handle_lap(LapCompletedIn::decode(&mut reader)?),
            PacketId::CarListRequest => {
                self.handle_car_list(CarListRequest::decode(&mut reader)?)
            }
            PacketId::CleanExitDrive => {
                info!("{} left the car", self.describe());
                self.begin_disconnect();
                Ok(())
            }
            PacketId::Extended => self.handle_extended(&mut reader),
            PacketId::RequestNewConnection => Err(ServerError::UnexpectedPacket {
                tag,
                state: "slot bound",
            }),
            other => {
                debug!("Ignoring {:?} from {}", other, self.describe());
                Ok(())
            }
        }
    }

    fn handle_handshake(self: &Arc<Self>, reader: &mut PacketReader<'_>) -> Result<(), ServerError> {
        let request = HandshakeRequest::decode(reader)?;
        debug!(
            "Handshake from {} ({}) for {}",
            request.name, request.guid, request.requested_car
        );

        match handshake::admit(&self.ctx, self, &request) {
            Ok(response) => {
                self.send(&response);
                info!(
                    "{} ({}, {}) joined in slot {} driving {}",
                    self.name(),
                    request.guid,
                    self.peer.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    response.slot_id,
                    response.car_model
                );
                self.ctx.events().lifecycle(self, LifecycleEvent::Connected);
                self.start_loading_timer();
                Ok(())
            }
            Err(rejection) => {
                self.rejected.store(true, Ordering::Release);
                self.send(&rejection);
                self.begin_disconnect();
                Err(ServerError::AuthenticationFailure(rejection))
            }
        }
    }

    fn handle_checksum(self: &Arc<Self>, payload: &[u8]) -> Result<(), ServerError> {
        if self.has_passed_checksum() {
            debug!("Ignoring repeated checksum from {}", self.describe());
            return Ok(());
        }
        let Some(slot) = self.client_slot() else {
            return Ok(());
        };

        let mut verdict = ChecksumVerdict {
            valid: self.ctx.checksums().verify(&slot.entry().model, payload),
        };
        if !verdict.valid {
            self.ctx.events().checksum(self, &mut verdict);
        }

        if !verdict.valid {
            self.ctx.kick_checksum_failed(self, "a checksum mismatch");
            return Err(ServerError::ChecksumFailure);
        }

        self.mark_checksum_passed();
        debug!("{} passed the checksum check", self.describe());
        let identity = self.identity();
        self.ctx.broadcast(
            &CarConnected {
                slot_id: slot.slot_id(),
                name: self.name().to_string(),
                nation: identity.map(|i| i.nation.clone()).unwrap_or_default(),
            },
            Some(self),
        );
        Ok(())
    }

    fn handle_chat(self: &Arc<Self>, mut chat: ChatMessage) -> Result<(), ServerError> {
        let now = self.ctx.now_ms();
        let last = self.last_chat.load(Ordering::Acquire);
        if now.saturating_sub(last) < CHAT_RATE_LIMIT_MS {
            debug!("Dropping chat from {}, rate limited", self.describe());
            return Ok(());
        }
        self.last_chat.store(now, Ordering::Release);

        let Some(slot) = self.client_slot() else {
            return Ok(());
        };
        slot.mark_active(now);
        chat.slot_id = slot.slot_id();

        let events = self.ctx.events();
        if events.chat_raw(self, &mut chat) == EventFlow::Cancel {
            return Ok(());
        }
        if self.ctx.services().commands.try_handle(self, &chat) {
            return Ok(());
        }
        if events.chat_message(self, &mut chat) == EventFlow::Cancel {
            return Ok(());
        }

        info!("CHAT: {}: {}", self.name(), chat.message);
        self.ctx.broadcast(&chat, None);
        Ok(())
    }

    fn handle_damage(self: &Arc<Self>, update: DamageUpdateIn) -> Result<(), ServerError> {
        let Some(slot) = self.client_slot() else {
            return Ok(());
        };
        slot.set_damage(update.damage_zone_level);
        self.ctx.broadcast(
            &DamageUpdate {
                slot_id: slot.slot_id(),
                damage_zone_level: update.damage_zone_level,
            },
            Some(self),
        );
        Ok(())
    }

    fn handle_tyre_change(self: &Arc<Self>, change: TyreCompoundChange) -> Result<(), ServerError> {
        let Some(slot) = self.client_slot() else {
            return Ok(());
        };
        slot.set_tyre_compound(&change.compound);
        self.ctx.broadcast(
            &TyreCompoundUpdate {
                slot_id: slot.slot_id(),
                compound: change.compound,
            },
            None,
        );
        Ok(())
    }

    fn handle_lap(self: &Arc<Self>, lap: LapCompletedIn) -> Result<(), ServerError> {
        let Some(slot) = self.client_slot() else {
            return Ok(());
        };
        let slot_id = slot.slot_id();
        let sessions = self.ctx.sessions();
        let accepted = sessions.on_lap_completed(slot_id, &lap, slot.ping(), self.ctx.now_ms());

        if accepted {
            info!(
                "Lap completed by {}, {} cuts, lap time {}",
                self.describe(),
                lap.cuts,
                lap.lap_time
            );
        } else {
            debug!("Lap from {} rejected", self.describe());
        }
        self.ctx.events().lap_completed(
            self,
            &LapCompletedEvent {
                slot_id,
                lap,
                accepted,
            },
        );

        if accepted {
            self.ctx.broadcast(
                &LapCompletedOut {
                    slot_id,
                    lap_time: lap.lap_time,
                    cuts: lap.cuts,
                    standings: sessions.standings(),
                    track_grip: self.ctx.services().weather.track_grip(),
                },
                None,
            );
        }
        Ok(())
    }

    fn handle_car_list(&self, request: CarListRequest) -> Result<(), ServerError> {
        let start = request.page_index as usize * CAR_LIST_PAGE_SIZE;
        let entries = self
            .ctx
            .slots()
            .client_slots()
            .skip(start)
            .take(CAR_LIST_PAGE_SIZE)
            .map(|slot| {
                let driver = slot.connection();
                let identity = driver.as_ref().and_then(|c| c.identity());
                CarListEntry {
                    slot_id: slot.slot_id(),
                    model: slot.entry().model.clone(),
                    skin: slot.entry().skin.clone(),
                    driver_name: identity.map(|i| i.name.clone()).unwrap_or_default(),
                    driver_team: identity.map(|i| i.team.clone()).unwrap_or_default(),
                    driver_nation: identity.map(|i| i.nation.clone()).unwrap_or_default(),
                    is_spectator: false,
                    damage_zone_level: slot.instance().modify(|status| status.damage_zone_level),
                }
            })
            .collect();

        self.send(&CarListResponse {
            page_index: request.page_index,
            entries,
        });
        Ok(())
    }

    fn handle_extended(self: &Arc<Self>, reader: &mut PacketReader<'_>) -> Result<(), ServerError> {
        let sub_tag = reader.read_u8()?;
        match ExtendedTcpId::try_from(sub_tag) {
            Ok(ExtendedTcpId::SpectateCar) => {
                let request = SpectateCar::decode(reader)?;
                if let Some(slot) = self.client_slot() {
                    let valid = request.slot_id != slot.slot_id()
                        && self.ctx.slots().client(request.slot_id).is_some();
                    slot.set_spectating(valid.then_some(request.slot_id));
                }
            }
            Ok(ExtendedTcpId::ClientMessage) => {
                self.ctx
                    .services()
                    .client_messages
                    .on_client_message(self, reader.rest(), true);
            }
            _ => debug!(
                "Ignoring extended packet 0x{:02X} from {}",
                sub_tag,
                self.describe()
            ),
        }
        Ok(())
    }

    /// Applies a telemetry datagram from this connection's car.
    ///
    /// The first one starts the checksum timer. Updates are only applied once
    /// the checksum passed and the security level is sufficient; the first
    /// applied one triggers the first update sequence.
    pub(crate) fn on_position_update(
        self: &Arc<Self>,
        update: &PositionUpdateIn,
        now_ms: i64,
    ) -> Result<(), ServerError> {
        if !self.received_first_position.swap(true, Ordering::AcqRel) {
            self.start_checksum_timer();
        }

        let extra = &self.ctx.config().extra;
        if !self.has_passed_checksum() || self.security_level() < extra.mandatory_client_security_level {
            trace!("Ignoring telemetry from {} until checks pass", self.describe());
            return Ok(());
        }
        let Some(slot) = self.client_slot() else {
            return Ok(());
        };

        let falling = slot.apply_position(update, now_ms, extra.afk_kick_behavior)?;
        if !self.has_sent_first_update() {
            self.send_first_update(now_ms);
        }
        if falling {
            info!("{} is falling through the world, resending session", self.describe());
            self.ctx.send_current_session(self);
        }
        Ok(())
    }

    /// Welcome message, other cars' tyres and the standings, then in game.
    fn send_first_update(self: &Arc<Self>, now_ms: i64) {
        let Some(own) = self.client_slot() else {
            return;
        };
        let ctx = &self.ctx;

        let welcome = &ctx.config().extra.welcome_message;
        if !welcome.is_empty() {
            self.send(&WelcomeMessage {
                message: welcome.clone(),
            });
        }

        for slot in ctx.slots().client_slots() {
            if slot.slot_id() == own.slot_id() || !slot.is_bound() {
                continue;
            }
            let compound = slot.instance().modify(|status| status.current_tyre_compound.clone());
            if !compound.is_empty() {
                self.send(&TyreCompoundUpdate {
                    slot_id: slot.slot_id(),
                    compound,
                });
            }
        }

        self.send(&LapCompletedOut {
            slot_id: LapCompletedOut::STANDINGS_ONLY,
            lap_time: 0,
            cuts: 0,
            standings: ctx.sessions().standings(),
            track_grip: ctx.services().weather.track_grip(),
        });

        own.begin_timing(now_ms);
        self.mark_first_update_sent();
        ctx.events().lifecycle(self, LifecycleEvent::FirstUpdateSent);
        info!("{} is now in game", self.describe());
    }

    fn start_loading_timer(&self) {
        let timeout = self.ctx.config().loading_timeout();
        let connection = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = connection.upgrade() else {
                return;
            };
            if connection.has_received_first_position() || connection.is_disconnect_requested() {
                return;
            }
            info!("{} did not finish loading in time", connection.describe());
            connection.begin_disconnect();
        });
    }

    fn start_checksum_timer(&self) {
        let timeout = self.ctx.config().checksum_timeout();
        let connection = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = connection.upgrade() else {
                return;
            };
            if connection.has_passed_checksum() || connection.is_disconnect_requested() {
                return;
            }
            connection
                .ctx
                .kick_checksum_failed(&connection, "not sending the requested checksums");
        });
    }
}

async fn send_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>, id: u64) {
    // Outbound packets may exceed the client's receive limit only up to the
    // length prefix range.
    let config = FrameConfig {
        max_payload_size: u16::MAX,
    };
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, &config).await {
            debug!("Send loop of connection #{} stopped: {}", id, e);
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of connection #{} failed: {}", id, e);
    }
}
