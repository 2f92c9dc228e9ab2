//! Shared server state.
//!
//! [`ServerContext`] is built once at startup and shared by every task behind
//! an `Arc`. It owns the slot registry, the session engine and the observer
//! registries, and offers the cross-connection operations: broadcast, kick,
//! ban and session cycling.

use crate::broadcast::TickMetrics;
use crate::checksum::ChecksumManifest;
use crate::clock::ServerClock;
use crate::config::{ConfigError, ServerConfig};
use crate::connection::Connection;
use crate::datagram::EndpointMap;
use crate::events::{KickAudit, LifecycleEvent, ServerEvents};
use crate::filters::SlotFilterChain;
use crate::services::Services;
use crate::session::SessionManager;
use crate::slots::SlotRegistry;
use log::{debug, info, trace, warn};
use shared::packets::{to_bytes, ChatMessage, Encode, KickBanMessage, KickCar};
use shared::{KickReason, SERVER_SLOT_ID};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct ServerContext {
    config: ServerConfig,
    clock: ServerClock,
    events: ServerEvents,
    services: Services,
    slots: SlotRegistry,
    sessions: SessionManager,
    checksums: ChecksumManifest,
    filters: SlotFilterChain,
    endpoints: EndpointMap,
    metrics: TickMetrics,
    udp: OnceLock<Arc<UdpSocket>>,
    random_seed: u32,
    shutdown: watch::Sender<bool>,
}

impl ServerContext {
    /// Validates `config` and builds every component from it.
    pub fn new(
        config: ServerConfig,
        services: Services,
        checksums: ChecksumManifest,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_events(config, services, checksums, ServerEvents::new())
    }

    /// Like [`new`](Self::new), with observers registered up front.
    pub fn with_events(
        config: ServerConfig,
        services: Services,
        checksums: ChecksumManifest,
        events: ServerEvents,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let clock = ServerClock::new();
        let slots = SlotRegistry::initialize(&config.entries, config.extra.ai_instances_per_slot);
        let sessions = SessionManager::new(
            config.sessions.clone(),
            slots.len(),
            config.race_over_time_secs as i64 * 1_000,
            config.has_extra_lap,
            clock.now_ms(),
        );
        let filters = SlotFilterChain::from_config(&config);
        let (shutdown, _) = watch::channel(false);

        info!(
            "Server context ready: {} slots, {} sessions, {} checksum files",
            slots.len(),
            config.sessions.len(),
            checksums.track_paths().len()
        );

        Ok(Arc::new(Self {
            clock,
            events,
            services,
            slots,
            sessions,
            checksums,
            filters,
            endpoints: EndpointMap::new(),
            metrics: TickMetrics::default(),
            udp: OnceLock::new(),
            random_seed: rand::random(),
            shutdown,
            config,
        }))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: ServerConfig) -> Arc<Self> {
        let services = Services::in_memory(config.sun_angle, config.track_grip);
        Self::new(config, services, ChecksumManifest::new()).unwrap()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn events(&self) -> &ServerEvents {
        &self.events
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn checksums(&self) -> &ChecksumManifest {
        &self.checksums
    }

    pub fn filters(&self) -> &SlotFilterChain {
        &self.filters
    }

    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    pub fn random_seed(&self) -> u32 {
        self.random_seed
    }

    /// Installs the shared datagram socket. Only the first call has effect.
    pub fn attach_udp(&self, socket: Arc<UdpSocket>) {
        if self.udp.set(socket).is_err() {
            debug!("Datagram socket already attached");
        }
    }

    /// Sends one datagram without waiting. A full socket buffer drops it.
    pub fn send_datagram_to(&self, addr: SocketAddr, bytes: &[u8]) {
        let Some(socket) = self.udp.get() else {
            trace!("No datagram socket, dropping {} bytes for {}", bytes.len(), addr);
            return;
        };
        match socket.try_send_to(bytes, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("Datagram socket busy, dropped packet for {}", addr);
            }
            Err(e) => debug!("Failed to send datagram to {}: {}", addr, e),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connections that finished their first update and are not closing.
    pub fn in_game_connections(&self) -> Vec<Arc<Connection>> {
        self.slots
            .connections()
            .into_iter()
            .filter(|c| c.has_sent_first_update() && !c.is_disconnect_requested())
            .collect()
    }

    /// Sends a packet to every in-game connection, optionally skipping one.
    pub fn broadcast<P: Encode + ?Sized>(&self, packet: &P, except: Option<&Arc<Connection>>) {
        let bytes = match to_bytes(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode broadcast packet: {}", e);
                return;
            }
        };
        let droppable = packet.is_droppable();
        for connection in self.in_game_connections() {
            if except.is_some_and(|skip| Arc::ptr_eq(skip, &connection)) {
                continue;
            }
            connection.send_bytes(bytes.clone(), droppable);
        }
    }

    /// Chat line from the server to everyone in game.
    pub fn broadcast_chat(&self, message: impl Into<String>) {
        self.broadcast(
            &ChatMessage {
                slot_id: SERVER_SLOT_ID,
                message: message.into(),
            },
            None,
        );
    }

    /// Sends the current session to one connection, shifted to its clock.
    pub fn send_current_session(&self, connection: &Connection) {
        let offset = connection
            .slot_id()
            .and_then(|id| self.slots.client(id))
            .map_or(0, |slot| slot.time_offset());
        let update = self
            .sessions
            .session_update(offset, self.services.weather.track_grip());
        connection.send(&update);
    }

    /// Advances the session rotation and tells every in-game client.
    pub fn next_session(&self, now_ms: i64) {
        self.sessions.next_session(now_ms);
        for connection in self.in_game_connections() {
            self.send_current_session(&connection);
        }
    }

    /// Kicks a connection: public chat notice, direct notice, audit event,
    /// then disconnect. Does nothing if the connection is already closing.
    pub fn kick(
        &self,
        connection: &Arc<Connection>,
        reason: KickReason,
        reason_text: &str,
        admin: Option<String>,
    ) {
        let notice = format!(
            "{} has been kicked from the server for {}.",
            connection.name(),
            reason_text
        );
        self.remove(connection, reason, reason_text, admin, notice, false);
    }

    /// Kick after a checksum mismatch or timeout.
    pub fn kick_checksum_failed(&self, connection: &Arc<Connection>, reason_text: &str) {
        let notice = format!(
            "{} failed the checksum check and has been kicked.",
            connection.name()
        );
        self.remove(connection, KickReason::ChecksumFailed, reason_text, None, notice, false);
    }

    /// Blacklists the connection's identity, then removes it.
    pub fn ban(&self, connection: &Arc<Connection>, reason_text: &str, admin: Option<String>) {
        if let Some(identity) = connection.identity() {
            self.services.blacklist.add(identity.guid);
            if let Some(owner) = identity.owner_guid {
                self.services.blacklist.add(owner);
            }
        }
        let notice = format!(
            "{} has been banned from the server for {}.",
            connection.name(),
            reason_text
        );
        self.remove(connection, KickReason::VoteBanned, reason_text, admin, notice, true);
    }

    /// Re-checks every bound connection against the blacklist.
    /// Returns the number of connections removed.
    pub fn reload_blacklist(&self) -> usize {
        let mut removed = 0;
        for connection in self.slots.connections() {
            let Some(guid) = connection.guid() else {
                continue;
            };
            if self.services.blacklist.is_blacklisted(guid) && !connection.is_disconnect_requested() {
                self.kick(&connection, KickReason::VoteBlacklisted, "being blacklisted", None);
                removed += 1;
            }
        }
        removed
    }

    fn remove(
        &self,
        connection: &Arc<Connection>,
        reason: KickReason,
        reason_text: &str,
        admin: Option<String>,
        notice: String,
        banned: bool,
    ) {
        if connection.is_disconnect_requested() {
            return;
        }
        warn!(
            "Removing {} ({:?}): {}",
            connection.name(),
            reason,
            reason_text
        );

        self.broadcast_chat(notice);
        if connection.supports_custom_update() {
            let verb = if banned { "banned" } else { "kicked" };
            connection.send(&KickBanMessage {
                message: format!("You have been {} for {}", verb, reason_text),
            });
        }
        if let Some(slot_id) = connection.slot_id() {
            connection.send(&KickCar { slot_id, reason });
        }

        let audit = KickAudit {
            reason,
            reason_text: Some(reason_text.to_string()),
            admin,
        };
        let event = if banned {
            LifecycleEvent::Banned(audit)
        } else {
            LifecycleEvent::Kicked(audit)
        };
        self.events.lifecycle(connection, event);
        connection.begin_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryConfig;
    use crate::filters::SlotFilterChain;
    use crate::services::GuidList;
    use crate::slots::SlotRequest;
    use parking_lot::Mutex;
    use shared::packets::CarDisconnected;
    use shared::{PacketId, PacketReader};

    fn two_slot_context() -> Arc<ServerContext> {
        let mut config = ServerConfig::default();
        config.entries = vec![EntryConfig::default(), EntryConfig::default()];
        ServerContext::for_tests(config)
    }

    fn bind(ctx: &Arc<ServerContext>, guid: u64, name: &str) -> Arc<Connection> {
        let connection = Connection::detached(ctx);
        connection.set_identity_for_tests(guid, name);
        ctx.slots()
            .try_secure_slot(
                &connection,
                &SlotRequest {
                    model: "ks_mazda_mx5_cup",
                    guid,
                    is_admin: false,
                },
                &SlotFilterChain::new(),
            )
            .unwrap();
        connection.mark_checksum_passed();
        connection.mark_first_update_sent();
        connection
    }

    fn tags(connection: &Connection) -> Vec<u8> {
        let mut receiver = connection.take_outbound().unwrap();
        let mut tags = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            tags.push(frame[0]);
        }
        tags
    }

    #[tokio::test]
    async fn broadcast_skips_the_excluded_connection() {
        let ctx = two_slot_context();
        let a = bind(&ctx, 1, "Alice");
        let b = bind(&ctx, 2, "Bob");

        ctx.broadcast(&CarDisconnected { slot_id: 9 }, Some(&a));

        assert!(tags(&a).is_empty());
        assert_eq!(tags(&b), vec![u8::from(PacketId::CarDisconnected)]);
    }

    #[tokio::test]
    async fn kick_notifies_everyone_and_releases_the_slot() {
        let ctx = two_slot_context();
        let audits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&audits);
        ctx.events().on_lifecycle(move |_, event| sink.lock().push(event.clone()));

        let target = bind(&ctx, 1, "Alice");
        let witness = bind(&ctx, 2, "Bob");
        let mut witness_rx = witness.take_outbound().unwrap();

        ctx.kick(&target, KickReason::Kicked, "testing", Some("admin".into()));

        let chat = witness_rx.try_recv().unwrap();
        let mut reader = PacketReader::new(&chat);
        assert_eq!(reader.read_u8().unwrap(), u8::from(PacketId::Chat));
        assert_eq!(reader.read_u8().unwrap(), SERVER_SLOT_ID);
        assert_eq!(
            reader.read_utf32().unwrap(),
            "Alice has been kicked from the server for testing."
        );

        assert!(target.is_disconnect_requested());
        assert!(!ctx.slots().client(0).unwrap().is_bound());
        assert!(matches!(
            audits.lock().first(),
            Some(LifecycleEvent::Kicked(KickAudit { reason: KickReason::Kicked, .. }))
        ));

        // Second kick is a no-op.
        ctx.kick(&target, KickReason::Kicked, "again", None);
        assert_eq!(audits.lock().iter().filter(|e| matches!(e, LifecycleEvent::Kicked(_))).count(), 1);
    }

    #[tokio::test]
    async fn ban_adds_to_blacklist() {
        let mut config = ServerConfig::default();
        config.entries = vec![EntryConfig::default()];
        let blacklist = Arc::new(GuidList::new());
        let mut services = Services::in_memory(0.0, 1.0);
        services.blacklist = blacklist.clone();
        let ctx = ServerContext::new(config, services, ChecksumManifest::new()).unwrap();

        let connection = bind(&ctx, 42, "Carl");
        ctx.ban(&connection, "griefing", None);
        assert!(blacklist.contains(42));
        assert!(connection.is_disconnect_requested());
    }

    #[tokio::test]
    async fn blacklist_reload_kicks_matching_connections() {
        let mut config = ServerConfig::default();
        config.entries = vec![EntryConfig::default(), EntryConfig::default()];
        let blacklist = Arc::new(GuidList::new());
        let mut services = Services::in_memory(0.0, 1.0);
        services.blacklist = blacklist.clone();
        let ctx = ServerContext::new(config, services, ChecksumManifest::new()).unwrap();

        let banned = bind(&ctx, 7, "Dan");
        let fine = bind(&ctx, 8, "Eve");
        blacklist.insert(7);

        assert_eq!(ctx.reload_blacklist(), 1);
        assert!(banned.is_disconnect_requested());
        assert!(!fine.is_disconnect_requested());
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = ServerConfig::default();
        config.sessions.clear();
        let services = Services::in_memory(0.0, 1.0);
        assert!(matches!(
            ServerContext::new(config, services, ChecksumManifest::new()),
            Err(ConfigError::NoSessions)
        ));
    }
}
