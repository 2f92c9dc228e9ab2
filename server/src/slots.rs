//! Slot registry and per-car state.
//!
//! The registry is a fixed array built once from the entry list. Each slot is
//! either a [`ClientSlot`], which a single connection can bind, or an
//! [`AiSlot`], which owns a pool of server-driven [`CarInstance`]s. Both
//! implement [`EntryCar`], the capability set the tick loop and broadcaster
//! work against.
//!
//! ## Locking
//!
//! Binding and releasing client slots is the only operation that needs
//! exclusive access to the registry, and it runs under one registry-wide
//! critical section. Telemetry lives behind a short per-instance mutex:
//! each instance has exactly one writer (its connection, or the tick loop for
//! AI) and one reader (the tick loop), and updates replace the whole status
//! in one critical section so readers never see a half-written record.

use crate::config::{AfkKickBehavior, EntryConfig};
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::{ServerError, SlotError};
use crate::events::ServerEvents;
use crate::filters::SlotFilterChain;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use shared::packets::{ChatMessage, PingUpdate, DAMAGE_ZONES};
use shared::{CarStatus, KickReason, PositionUpdateIn, Vector3, SERVER_SLOT_ID};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type SlotId = u8;

/// Interval between ping datagrams to a client.
pub const PING_INTERVAL_MS: i64 = 1_000;

/// Silence after which a client is considered gone.
pub const PONG_TIMEOUT_MS: i64 = 15_000;

/// Minimum gap between two falling resets of the same car.
pub const FALLING_RESET_COOLDOWN_MS: i64 = 5_000;

/// Speed that counts as driving for AFK detection, in m/s.
const AFK_MINIMUM_SPEED: f32 = 20.0 / 3.6;

const AFK_WARNING_MS: i64 = 60_000;

/// Live telemetry of one car.
#[derive(Debug, Default)]
pub struct CarInstance {
    status: Mutex<CarStatus>,
    dirty: AtomicBool,
}

impl CarInstance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a client update and marks the instance dirty.
    pub fn apply(&self, update: &PositionUpdateIn, now_ms: i64) {
        self.status.lock().apply(update, now_ms);
        self.dirty.store(true, Ordering::Release);
    }

    /// Mutates the status in place. Does not touch the dirty flag.
    pub fn modify<R>(&self, f: impl FnOnce(&mut CarStatus) -> R) -> R {
        f(&mut self.status.lock())
    }

    pub fn snapshot(&self) -> CarStatus {
        self.status.lock().clone()
    }

    pub fn position(&self) -> Vector3 {
        self.status.lock().position
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Returns the instance to its initial state so the slot can be rebound.
    pub fn reset(&self) {
        *self.status.lock() = CarStatus::default();
        self.clear_dirty();
    }
}

/// Capabilities shared by every slot kind.
pub trait EntryCar {
    fn slot_id(&self) -> SlotId;

    fn entry(&self) -> &EntryConfig;

    /// Per-tick housekeeping. `dt` is the tick period in seconds.
    fn update(&self, ctx: &ServerContext, now_ms: i64, dt: f32);

    fn instances(&self) -> Vec<Arc<CarInstance>>;

    /// The instance a viewer at `viewer` should see, if any.
    fn best_instance_for(&self, viewer: Option<&Vector3>) -> Option<Arc<CarInstance>>;

    /// Measured latency reported alongside this car's updates.
    fn ping(&self) -> u16 {
        0
    }
}

/// Latency and activity bookkeeping for a client slot.
#[derive(Debug, Clone, Default)]
pub struct ClientTiming {
    pub ping: u16,
    /// Server time minus client time, in milliseconds.
    pub time_offset: i64,
    pub last_ping_sent: i64,
    pub last_pong: i64,
    pub high_ping_since: Option<i64>,
    pub last_active: i64,
    pub afk_warning_sent: bool,
    pub last_falling_reset: Option<i64>,
}

impl ClientTiming {
    /// Records a pong and returns the ping when it has stayed above
    /// `max_ping_ms` for longer than `max_ping_seconds`.
    pub fn record_pong(
        &mut self,
        now_ms: i64,
        echoed_server_time: u32,
        client_time: u32,
        max_ping_ms: u16,
        max_ping_seconds: u32,
    ) -> Option<u16> {
        let round_trip = (now_ms as u32).wrapping_sub(echoed_server_time);
        let ping = round_trip.min(u16::MAX as u32) as u16;
        self.ping = ping;
        self.time_offset = now_ms - (ping as i64 / 2 + client_time as i64);
        self.last_pong = now_ms;

        if ping <= max_ping_ms {
            self.high_ping_since = None;
            return None;
        }
        match self.high_ping_since {
            Some(since) if now_ms - since > max_ping_seconds as i64 * 1_000 => Some(ping),
            Some(_) => None,
            None => {
                self.high_ping_since = Some(now_ms);
                None
            }
        }
    }

    pub fn mark_active(&mut self, now_ms: i64) {
        self.last_active = now_ms;
        self.afk_warning_sent = false;
    }
}

/// A slot a human driver can occupy.
pub struct ClientSlot {
    id: SlotId,
    entry: EntryConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    instance: Arc<CarInstance>,
    timing: Mutex<ClientTiming>,
    spectating: Mutex<Option<SlotId>>,
}

impl ClientSlot {
    pub fn new(id: SlotId, entry: EntryConfig) -> Self {
        Self {
            id,
            entry,
            connection: RwLock::new(None),
            instance: Arc::new(CarInstance::new()),
            timing: Mutex::new(ClientTiming::default()),
            spectating: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.connection.read().is_some()
    }

    pub fn instance(&self) -> &Arc<CarInstance> {
        &self.instance
    }

    pub fn timing(&self) -> ClientTiming {
        self.timing.lock().clone()
    }

    pub fn time_offset(&self) -> i64 {
        self.timing.lock().time_offset
    }

    pub fn spectating(&self) -> Option<SlotId> {
        *self.spectating.lock()
    }

    pub fn set_spectating(&self, target: Option<SlotId>) {
        *self.spectating.lock() = target;
    }

    /// Starts liveness tracking from the moment the car enters the game.
    pub fn begin_timing(&self, now_ms: i64) {
        let mut timing = self.timing.lock();
        timing.last_pong = now_ms;
        timing.last_ping_sent = now_ms;
        timing.mark_active(now_ms);
    }

    pub fn mark_active(&self, now_ms: i64) {
        self.timing.lock().mark_active(now_ms);
    }

    pub fn record_pong(
        &self,
        now_ms: i64,
        echoed_server_time: u32,
        client_time: u32,
        max_ping_ms: u16,
        max_ping_seconds: u32,
    ) -> Option<u16> {
        self.timing.lock().record_pong(
            now_ms,
            echoed_server_time,
            client_time,
            max_ping_ms,
            max_ping_seconds,
        )
    }

    /// Applies a telemetry datagram from the bound client.
    ///
    /// Returns `Ok(true)` when the car is falling through the world and the
    /// client should be sent the session again to respawn.
    pub fn apply_position(
        &self,
        update: &PositionUpdateIn,
        now_ms: i64,
        afk_behavior: AfkKickBehavior,
    ) -> Result<bool, ServerError> {
        if !update.is_valid() {
            return Err(ServerError::InvalidTelemetry(self.id));
        }

        let previous = self.instance.snapshot();
        self.instance.apply(update, now_ms);

        let mut timing = self.timing.lock();
        let active = match afk_behavior {
            AfkKickBehavior::PlayerInput => {
                update.gas != previous.gas || update.steer_angle != previous.steer_angle
            }
            AfkKickBehavior::MinimumSpeed => {
                update.velocity.length_squared() > AFK_MINIMUM_SPEED * AFK_MINIMUM_SPEED
            }
        };
        if active {
            timing.mark_active(now_ms);
        }

        let falling = update.velocity.y < shared::telemetry::FALLING_VELOCITY_THRESHOLD;
        let cooled_down = timing
            .last_falling_reset
            .map_or(true, |at| now_ms - at >= FALLING_RESET_COOLDOWN_MS);
        if falling && cooled_down {
            timing.last_falling_reset = Some(now_ms);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn set_damage(&self, levels: [f32; DAMAGE_ZONES]) {
        self.instance.modify(|status| status.damage_zone_level = levels);
    }

    pub fn set_tyre_compound(&self, compound: &str) {
        self.instance
            .modify(|status| status.current_tyre_compound = compound.to_string());
    }

    fn bind(&self, connection: Arc<Connection>) {
        *self.connection.write() = Some(connection);
    }

    fn clear(&self) {
        *self.connection.write() = None;
        self.instance.reset();
        *self.timing.lock() = ClientTiming::default();
        *self.spectating.lock() = None;
    }
}

impl EntryCar for ClientSlot {
    fn slot_id(&self) -> SlotId {
        self.id
    }

    fn entry(&self) -> &EntryConfig {
        &self.entry
    }

    fn update(&self, ctx: &ServerContext, now_ms: i64, _dt: f32) {
        let Some(connection) = self.connection() else {
            return;
        };
        if !connection.has_sent_first_update() || connection.is_disconnect_requested() {
            return;
        }

        let mut timing = self.timing.lock();
        if now_ms - timing.last_ping_sent >= PING_INTERVAL_MS {
            timing.last_ping_sent = now_ms;
            connection.send_datagram(&PingUpdate {
                server_time: now_ms as u32,
                ping: timing.ping,
            });

            if now_ms - timing.last_pong >= PONG_TIMEOUT_MS {
                drop(timing);
                info!(
                    "{} has not answered pings for {} seconds, disconnecting",
                    connection.name(),
                    PONG_TIMEOUT_MS / 1_000
                );
                connection.begin_disconnect();
                return;
            }
        }

        let extra = &ctx.config().extra;
        if !extra.enable_anti_afk || connection.is_admin() {
            return;
        }
        let afk_ms = now_ms - timing.last_active;
        let max_afk_ms = extra.max_afk_time_minutes as i64 * 60_000;
        if afk_ms > max_afk_ms {
            drop(timing);
            ctx.kick(&connection, KickReason::Kicked, "being AFK", None);
        } else if afk_ms > max_afk_ms - AFK_WARNING_MS && !timing.afk_warning_sent {
            timing.afk_warning_sent = true;
            drop(timing);
            connection.send(&ChatMessage {
                slot_id: SERVER_SLOT_ID,
                message: "You will be kicked in 1 minute for being AFK.".into(),
            });
        }
    }

    fn instances(&self) -> Vec<Arc<CarInstance>> {
        vec![Arc::clone(&self.instance)]
    }

    fn best_instance_for(&self, _viewer: Option<&Vector3>) -> Option<Arc<CarInstance>> {
        self.is_bound().then(|| Arc::clone(&self.instance))
    }

    fn ping(&self) -> u16 {
        self.timing.lock().ping
    }
}

/// A slot driven by the server, holding a capped pool of instances.
pub struct AiSlot {
    id: SlotId,
    entry: EntryConfig,
    instances: Mutex<Vec<Arc<CarInstance>>>,
    max_instances: usize,
}

impl AiSlot {
    pub fn new(id: SlotId, entry: EntryConfig, max_instances: usize) -> Self {
        Self {
            id,
            entry,
            instances: Mutex::new(Vec::with_capacity(max_instances)),
            max_instances,
        }
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn spawn(&self) -> Result<Arc<CarInstance>, SlotError> {
        let mut instances = self.instances.lock();
        if instances.len() >= self.max_instances {
            return Err(SlotError::Unavailable);
        }
        let instance = Arc::new(CarInstance::new());
        instances.push(Arc::clone(&instance));
        Ok(instance)
    }

    /// Removes an instance and notifies instance-destroyed observers.
    pub fn despawn(&self, instance: &Arc<CarInstance>, events: &ServerEvents) -> bool {
        let removed = {
            let mut instances = self.instances.lock();
            let before = instances.len();
            instances.retain(|candidate| !Arc::ptr_eq(candidate, instance));
            before != instances.len()
        };
        if removed {
            events.instance_destroyed(self.id, instance);
        }
        removed
    }

    /// Dead-reckons every instance forward by `dt` seconds.
    pub fn advance(&self, now_ms: i64, dt: f32) {
        for instance in self.instances.lock().iter() {
            let moved = instance.modify(|status| {
                if status.velocity.length_squared() == 0.0 {
                    return false;
                }
                status.position = status.position.scaled_add(&status.velocity, dt);
                status.timestamp = now_ms;
                status.pak_sequence_id = status.pak_sequence_id.wrapping_add(1);
                true
            });
            if moved {
                instance.mark_dirty();
            }
        }
    }
}

impl EntryCar for AiSlot {
    fn slot_id(&self) -> SlotId {
        self.id
    }

    fn entry(&self) -> &EntryConfig {
        &self.entry
    }

    fn update(&self, _ctx: &ServerContext, now_ms: i64, dt: f32) {
        self.advance(now_ms, dt);
    }

    fn instances(&self) -> Vec<Arc<CarInstance>> {
        self.instances.lock().clone()
    }

    fn best_instance_for(&self, viewer: Option<&Vector3>) -> Option<Arc<CarInstance>> {
        let instances = self.instances.lock();
        match viewer {
            None => instances.first().cloned(),
            Some(origin) => instances
                .iter()
                .min_by(|a, b| {
                    let da = a.position().distance_squared(origin);
                    let db = b.position().distance_squared(origin);
                    da.total_cmp(&db)
                })
                .cloned(),
        }
    }
}

pub enum Slot {
    Client(ClientSlot),
    AiPool(AiSlot),
}

impl Slot {
    pub fn as_car(&self) -> &dyn EntryCar {
        match self {
            Slot::Client(slot) => slot,
            Slot::AiPool(slot) => slot,
        }
    }

    pub fn as_client(&self) -> Option<&ClientSlot> {
        match self {
            Slot::Client(slot) => Some(slot),
            Slot::AiPool(_) => None,
        }
    }

    pub fn as_ai(&self) -> Option<&AiSlot> {
        match self {
            Slot::AiPool(slot) => Some(slot),
            Slot::Client(_) => None,
        }
    }
}

/// What the registry needs to know about a driver asking for a slot.
#[derive(Debug, Clone)]
pub struct SlotRequest<'a> {
    pub model: &'a str,
    pub guid: u64,
    pub is_admin: bool,
}

/// Fixed array of slots, indexed by slot id.
pub struct SlotRegistry {
    slots: Vec<Slot>,
    bind_lock: Mutex<()>,
}

impl SlotRegistry {
    /// Builds the slot array. AI entries get up to `ai_instances_per_slot`
    /// instances spawned immediately.
    pub fn initialize(entries: &[EntryConfig], ai_instances_per_slot: usize) -> Self {
        let slots = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let id = index as SlotId;
                if entry.ai {
                    let slot = AiSlot::new(id, entry.clone(), ai_instances_per_slot);
                    for _ in 0..ai_instances_per_slot {
                        // Cannot fail below the cap.
                        let _ = slot.spawn();
                    }
                    Slot::AiPool(slot)
                } else {
                    Slot::Client(ClientSlot::new(id, entry.clone()))
                }
            })
            .collect();

        Self {
            slots,
            bind_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id as usize)
    }

    pub fn client(&self, id: SlotId) -> Option<&ClientSlot> {
        self.get(id).and_then(Slot::as_client)
    }

    pub fn client_slots(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter().filter_map(Slot::as_client)
    }

    /// Every bound connection, in slot order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.client_slots().filter_map(ClientSlot::connection).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.client_slots().filter(|slot| slot.is_bound()).count()
    }

    pub fn has_connected_clients(&self) -> bool {
        self.client_slots().any(ClientSlot::is_bound)
    }

    /// Finds a free client slot for the requested model and binds it.
    ///
    /// Admins skip the filter chain. When every matching free slot is vetoed
    /// the last veto reason is returned.
    pub fn try_secure_slot(
        &self,
        connection: &Arc<Connection>,
        request: &SlotRequest<'_>,
        filters: &SlotFilterChain,
    ) -> Result<SlotId, SlotError> {
        let _guard = self.bind_lock.lock();
        let occupancy = self.connected_count();
        let mut veto = None;

        for slot in self.client_slots() {
            if slot.entry.model != request.model || slot.is_bound() {
                continue;
            }
            if !request.is_admin {
                if let Err(reason) = filters.is_slot_open(slot, request.guid, occupancy) {
                    veto = Some(reason);
                    continue;
                }
            }
            if !connection.assign_slot(slot.id) {
                return Err(SlotError::Rejected("connection already holds a slot".into()));
            }
            slot.bind(Arc::clone(connection));
            return Ok(slot.id);
        }

        Err(veto.map_or(SlotError::Unavailable, SlotError::Rejected))
    }

    /// Unbinds the connection's slot and resets its car.
    ///
    /// Returns false, changing nothing, if the slot is no longer bound to this
    /// connection (a late or duplicate notification).
    pub fn release_slot(&self, connection: &Arc<Connection>) -> bool {
        let Some(id) = connection.slot_id() else {
            return false;
        };
        let _guard = self.bind_lock.lock();
        let Some(slot) = self.client(id) else {
            return false;
        };
        match slot.connection() {
            Some(bound) if Arc::ptr_eq(&bound, connection) => {
                slot.clear();
                true
            }
            _ => {
                warn!(
                    "Ignoring release of slot {} by {}, slot is bound elsewhere",
                    id,
                    connection.name()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::filters::GuidSlotFilter;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::AtomicUsize;

    fn registry_with_laferrari_at_5() -> SlotRegistry {
        let entries: Vec<EntryConfig> = (0..24)
            .map(|i| {
                if i == 5 {
                    EntryConfig::client("ks_laferrari")
                } else {
                    EntryConfig::client("ks_mazda_mx5_cup")
                }
            })
            .collect();
        SlotRegistry::initialize(&entries, 1)
    }

    fn request(model: &str) -> SlotRequest<'_> {
        SlotRequest {
            model,
            guid: 1,
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn secures_the_slot_matching_the_model() {
        let ctx = ServerContext::for_tests(ServerConfig::default());
        let registry = registry_with_laferrari_at_5();
        let connection = Connection::detached(&ctx);

        let id = registry
            .try_secure_slot(&connection, &request("ks_laferrari"), &SlotFilterChain::new())
            .unwrap();
        assert_eq!(id, 5);
        assert_eq!(connection.slot_id(), Some(5));
        assert!(registry.client(5).unwrap().is_bound());
        assert_eq!(registry.connected_count(), 1);

        let second = Connection::detached(&ctx);
        assert_eq!(
            registry.try_secure_slot(&second, &request("ks_laferrari"), &SlotFilterChain::new()),
            Err(SlotError::Unavailable)
        );
        assert_eq!(second.slot_id(), None);
    }

    #[tokio::test]
    async fn concurrent_binders_never_share_a_slot() {
        let ctx = ServerContext::for_tests(ServerConfig::default());
        let registry = Arc::new(registry_with_laferrari_at_5());
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let winners = Arc::clone(&winners);
            let connection = Connection::detached(&ctx);
            handles.push(std::thread::spawn(move || {
                let filters = SlotFilterChain::new();
                if registry
                    .try_secure_slot(&connection, &request("ks_laferrari"), &filters)
                    .is_ok()
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_veto_is_reported_and_admins_bypass_it() {
        let ctx = ServerContext::for_tests(ServerConfig::default());
        let mut entry = EntryConfig::client("ks_laferrari");
        entry.allowed_guids = vec![99];
        let registry = SlotRegistry::initialize(&[entry], 1);
        let mut filters = SlotFilterChain::new();
        filters.push(GuidSlotFilter);

        let outsider = Connection::detached(&ctx);
        assert!(matches!(
            registry.try_secure_slot(&outsider, &request("ks_laferrari"), &filters),
            Err(SlotError::Rejected(_))
        ));

        let admin = Connection::detached(&ctx);
        let admin_request = SlotRequest {
            is_admin: true,
            ..request("ks_laferrari")
        };
        assert_eq!(
            registry.try_secure_slot(&admin, &admin_request, &filters),
            Ok(0)
        );
    }

    #[tokio::test]
    async fn release_is_idempotent_and_resets_the_car() {
        let ctx = ServerContext::for_tests(ServerConfig::default());
        let registry = registry_with_laferrari_at_5();
        let connection = Connection::detached(&ctx);
        registry
            .try_secure_slot(&connection, &request("ks_laferrari"), &SlotFilterChain::new())
            .unwrap();

        let slot = registry.client(5).unwrap();
        slot.instance().apply(
            &PositionUpdateIn {
                position: Vector3::new(1.0, 2.0, 3.0),
                ..Default::default()
            },
            100,
        );
        assert!(slot.instance().is_dirty());

        assert!(registry.release_slot(&connection));
        assert!(!slot.is_bound());
        assert!(!slot.instance().is_dirty());
        assert_eq!(slot.instance().position(), Vector3::ZERO);

        assert!(!registry.release_slot(&connection));
    }

    #[test]
    fn high_ping_kicks_after_the_grace_period() {
        let mut timing = ClientTiming::default();
        let mut kicked_at = None;
        for second in 0..=11i64 {
            let now = 10_000 + second * 1_000;
            let echoed = (now - 300) as u32;
            if let Some(ping) = timing.record_pong(now, echoed, 0, 200, 10) {
                assert_eq!(ping, 300);
                kicked_at = Some(second);
                break;
            }
        }
        assert_eq!(kicked_at, Some(11));
    }

    #[test]
    fn normal_ping_resets_the_high_ping_window() {
        let mut timing = ClientTiming::default();
        assert_eq!(timing.record_pong(1_000, 700, 0, 200, 10), None);
        assert_eq!(timing.high_ping_since, Some(1_000));

        assert_eq!(timing.record_pong(2_000, 1_950, 0, 200, 10), None);
        assert_eq!(timing.high_ping_since, None);
        assert_eq!(timing.ping, 50);
    }

    #[test]
    fn pong_computes_clock_offset() {
        let mut timing = ClientTiming::default();
        timing.record_pong(5_000, 4_900, 1_000, 500, 10);
        assert_eq!(timing.ping, 100);
        assert_eq!(timing.time_offset, 5_000 - (50 + 1_000));
        assert_eq!(timing.last_pong, 5_000);
    }

    #[test]
    fn invalid_telemetry_is_refused() {
        let slot = ClientSlot::new(0, EntryConfig::default());
        let update = PositionUpdateIn {
            position: Vector3::new(f32::INFINITY, 0.0, 0.0),
            ..Default::default()
        };
        assert!(matches!(
            slot.apply_position(&update, 0, AfkKickBehavior::PlayerInput),
            Err(ServerError::InvalidTelemetry(0))
        ));
        assert!(!slot.instance().is_dirty());
    }

    #[test]
    fn falling_car_requests_a_reset_once_per_cooldown() {
        let slot = ClientSlot::new(0, EntryConfig::default());
        let falling = PositionUpdateIn {
            velocity: Vector3::new(0.0, -90.0, 0.0),
            ..Default::default()
        };
        assert!(slot.apply_position(&falling, 1_000, AfkKickBehavior::PlayerInput).unwrap());
        assert!(!slot.apply_position(&falling, 2_000, AfkKickBehavior::PlayerInput).unwrap());
        assert!(slot.apply_position(&falling, 6_000, AfkKickBehavior::PlayerInput).unwrap());
    }

    #[test]
    fn ai_instances_are_capped_and_dead_reckoned() {
        let slot = AiSlot::new(3, EntryConfig::ai("traffic"), 2);
        let first = slot.spawn().unwrap();
        slot.spawn().unwrap();
        assert_eq!(slot.spawn().unwrap_err(), SlotError::Unavailable);

        first.modify(|status| status.velocity = Vector3::new(10.0, 0.0, 0.0));
        slot.advance(500, 0.5);
        assert!(first.is_dirty());
        assert_approx_eq!(first.position().x, 5.0);
        assert_eq!(slot.instances().iter().filter(|i| i.is_dirty()).count(), 1);
    }

    #[test]
    fn ai_shows_the_instance_nearest_to_the_viewer() {
        let slot = AiSlot::new(0, EntryConfig::ai("traffic"), 3);
        for x in [0.0, 500.0, 1_000.0] {
            let instance = slot.spawn().unwrap();
            instance.modify(|status| status.position = Vector3::new(x, 0.0, 0.0));
        }
        let viewer = Vector3::new(620.0, 0.0, 0.0);
        let best = slot.best_instance_for(Some(&viewer)).unwrap();
        assert_approx_eq!(best.position().x, 500.0);
    }

    #[test]
    fn despawn_notifies_observers() {
        let events = ServerEvents::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        events.on_instance_destroyed(move |slot_id, _| {
            assert_eq!(slot_id, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let slot = AiSlot::new(7, EntryConfig::ai("traffic"), 1);
        let instance = slot.spawn().unwrap();
        assert!(slot.despawn(&instance, &events));
        assert!(!slot.despawn(&instance, &events));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(slot.instance_count(), 0);
    }

    #[test]
    fn registry_spawns_ai_pools() {
        let registry = SlotRegistry::initialize(
            &[EntryConfig::client("a"), EntryConfig::ai("traffic")],
            4,
        );
        assert_eq!(registry.len(), 2);
        assert!(registry.client(1).is_none());
        assert_eq!(registry.get(1).unwrap().as_ai().unwrap().instance_count(), 4);
        assert_eq!(registry.get(0).unwrap().as_car().instances().len(), 1);
    }
}
