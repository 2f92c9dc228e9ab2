//! Fixed-rate tick loop and position fan-out.
//!
//! Every tick runs the pre-tick observers, per-slot housekeeping, session
//! evaluation, and then sends each spawned recipient the cars that changed
//! since the previous tick. The loop keeps a fixed cadence by scheduling
//! against absolute deadlines; when it falls more than a period behind it
//! skips ahead instead of bursting to catch up.

use crate::connection::ConnectionState;
use crate::context::ServerContext;
use crate::slots::{ClientSlot, EntryCar};
use log::{debug, info, warn};
use shared::packets::{BatchedPositionUpdate, LegacyPositionUpdate};
use shared::{to_bytes, Encode, PositionUpdateOut, POSITION_BATCH_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Sleep between ticks while no client holds a slot.
pub const IDLE_SLEEP: Duration = Duration::from_millis(500);

const OVERRUN_WARN_THRESHOLD: Duration = Duration::from_millis(1_000);

/// Counters updated by the tick loop.
#[derive(Debug, Default)]
pub struct TickMetrics {
    ticks: AtomicU64,
    overruns: AtomicU64,
    last_tick_ms: AtomicI64,
    last_tick_micros: AtomicU64,
}

impl TickMetrics {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Server time of the last completed tick.
    pub fn last_tick_ms(&self) -> i64 {
        self.last_tick_ms.load(Ordering::Relaxed)
    }

    /// Wall time spent inside the last tick.
    pub fn last_tick_duration(&self) -> Duration {
        Duration::from_micros(self.last_tick_micros.load(Ordering::Relaxed))
    }

    fn record_tick(&self, now_ms: i64, took: Duration) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ms.store(now_ms, Ordering::Relaxed);
        self.last_tick_micros
            .store(took.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Not due yet.
    Sleep(Duration),
    Proceed,
    /// Due, but more than a period late. The schedule was moved forward.
    Overrun { behind: Duration },
}

/// Absolute-deadline tick schedule.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    period: Duration,
    next_deadline: Instant,
}

impl TickScheduler {
    /// The first tick is due at `now`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_deadline: now,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn poll(&mut self, now: Instant) -> TickAction {
        if now < self.next_deadline {
            return TickAction::Sleep(self.next_deadline - now);
        }

        let behind = now - self.next_deadline;
        if behind <= self.period {
            self.next_deadline += self.period;
            TickAction::Proceed
        } else {
            self.next_deadline = now + self.period;
            TickAction::Overrun { behind }
        }
    }

    /// Restarts the cadence one period from `now`.
    pub fn rebase(&mut self, now: Instant) {
        self.next_deadline = now + self.period;
    }
}

/// Per-tick work and the outbound position fan-out.
pub struct BroadcastEngine {
    ctx: Arc<ServerContext>,
    /// Scratch buffer reused for every recipient.
    statuses: Vec<PositionUpdateOut>,
    dt: f32,
}

impl BroadcastEngine {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let max_slots = ctx.config().max_slots();
        let dt = ctx.config().tick_period().as_secs_f32();
        Self {
            ctx,
            statuses: Vec::with_capacity(max_slots * max_slots),
            dt,
        }
    }

    /// Runs one tick at server time `now_ms`.
    pub fn tick(&mut self, now_ms: i64) {
        let ctx = Arc::clone(&self.ctx);
        ctx.events().pre_tick(now_ms);

        for slot in ctx.slots().iter() {
            slot.as_car().update(&ctx, now_ms, self.dt);
        }

        if ctx.sessions().update(now_ms) {
            ctx.next_session(now_ms);
        }

        if ctx.slots().has_connected_clients() {
            self.fan_out();
        }

        for slot in ctx.slots().iter() {
            for instance in slot.as_car().instances() {
                instance.clear_dirty();
            }
        }
    }

    /// The updates `recipient` should receive this tick.
    ///
    /// Skips the recipient's own car, client cars that are not in game, and
    /// anything that did not change. AI slots contribute the instance closest
    /// to the car the recipient is watching.
    pub fn collect_for(&mut self, recipient: &ClientSlot) -> &[PositionUpdateOut] {
        self.statuses.clear();
        let slots = self.ctx.slots();

        let viewer = recipient
            .spectating()
            .and_then(|target| slots.get(target))
            .and_then(|slot| slot.as_car().best_instance_for(None))
            .map_or_else(|| recipient.instance().position(), |instance| instance.position());
        let offset = recipient.time_offset();

        for slot in slots.iter() {
            let car = slot.as_car();
            if car.slot_id() == recipient.slot_id() {
                continue;
            }
            if let Some(client) = slot.as_client() {
                let in_game = client
                    .connection()
                    .is_some_and(|c| c.has_sent_first_update() && !c.is_disconnect_requested());
                if !in_game {
                    continue;
                }
            }

            let Some(instance) = car.best_instance_for(Some(&viewer)) else {
                continue;
            };
            if !instance.is_dirty() {
                continue;
            }
            let status = instance.snapshot();
            self.statuses.push(PositionUpdateOut::from_status(
                car.slot_id(),
                car.ping(),
                offset,
                &status,
            ));
        }

        &self.statuses
    }

    fn fan_out(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        for slot in ctx.slots().client_slots() {
            let Some(connection) = slot.connection() else {
                continue;
            };
            if connection.state() != ConnectionState::Spawned {
                continue;
            }
            let Some(addr) = connection.udp_addr() else {
                continue;
            };
            let batched = connection.supports_custom_update();

            let updates = self.collect_for(slot);
            if batched {
                for chunk in updates.chunks(POSITION_BATCH_SIZE) {
                    send_to(&ctx, addr, &BatchedPositionUpdate { entries: chunk });
                }
            } else {
                for update in updates {
                    send_to(&ctx, addr, &LegacyPositionUpdate(update));
                }
            }
        }
    }
}

fn send_to<P: Encode + ?Sized>(ctx: &ServerContext, addr: SocketAddr, packet: &P) {
    match to_bytes(packet) {
        Ok(bytes) => ctx.send_datagram_to(addr, &bytes),
        Err(e) => warn!("Failed to encode position update: {}", e),
    }
}

/// Drives [`BroadcastEngine`] until shutdown is requested.
pub async fn run_tick_loop(ctx: Arc<ServerContext>) {
    let period = ctx.config().tick_period();
    let mut engine = BroadcastEngine::new(Arc::clone(&ctx));
    let mut scheduler = TickScheduler::new(period, Instant::now());
    let mut shutdown = ctx.shutdown_signal();
    let log_every = ctx.config().refresh_rate_hz as u64 * 60;

    info!("Tick loop running at {} Hz", ctx.config().refresh_rate_hz);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match scheduler.poll(Instant::now()) {
            TickAction::Sleep(wait) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }
            TickAction::Proceed => {}
            TickAction::Overrun { behind } => {
                ctx.metrics().record_overrun();
                if behind > OVERRUN_WARN_THRESHOLD {
                    warn!(
                        "Can't keep up! Tick loop is {}ms behind, skipping ahead",
                        behind.as_millis()
                    );
                }
            }
        }

        let started = Instant::now();
        let now_ms = ctx.now_ms();
        engine.tick(now_ms);
        ctx.metrics().record_tick(now_ms, started.elapsed());

        let ticks = ctx.metrics().ticks();
        if log_every > 0 && ticks % log_every == 0 {
            debug!(
                "Tick {}: {} clients connected, last tick took {:?}, {} overruns",
                ticks,
                ctx.slots().connected_count(),
                ctx.metrics().last_tick_duration(),
                ctx.metrics().overruns()
            );
        }

        if !ctx.slots().has_connected_clients() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
            scheduler.rebase(Instant::now());
        }
    }
    debug!("Tick loop stopped");
}
