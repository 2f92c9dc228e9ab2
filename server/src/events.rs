//! Observer registries exposed to external collaborators.
//!
//! Collaborators subscribe at construction time; the core dispatches
//! synchronously, in registration order, on whichever task raised the event.
//! Cancellable events return [`EventFlow`] and stop at the first
//! [`EventFlow::Cancel`]. Observers must not block: they run on connection,
//! datagram and tick tasks.

use crate::connection::Connection;
use crate::slots::{CarInstance, SlotId};
use parking_lot::RwLock;
use shared::handshake::HandshakeResponse;
use shared::packets::{ChatMessage, LapCompletedIn};
use shared::KickReason;
use std::sync::Arc;

/// Result of a cancellable observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Cancel,
}

/// Audit record attached to kick and ban events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickAudit {
    pub reason: KickReason,
    pub reason_text: Option<String>,
    /// Name of the admin who issued it, `None` for automatic kicks.
    pub admin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Handshake accepted and slot bound.
    Connected,
    /// First update sequence sent; the car is now in game.
    FirstUpdateSent,
    Kicked(KickAudit),
    Banned(KickAudit),
    Disconnected,
}

/// Mutable verdict handed to checksum observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumVerdict {
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapCompletedEvent {
    pub slot_id: SlotId,
    pub lap: LapCompletedIn,
    /// False when the report was rejected by the lap rules.
    pub accepted: bool,
}

type Lifecycle = dyn Fn(&Arc<Connection>, &LifecycleEvent) + Send + Sync;
type Chat = dyn Fn(&Arc<Connection>, &mut ChatMessage) -> EventFlow + Send + Sync;
type Checksum = dyn Fn(&Arc<Connection>, &mut ChecksumVerdict) + Send + Sync;
type Lap = dyn Fn(&Arc<Connection>, &LapCompletedEvent) + Send + Sync;
type Handshake = dyn Fn(&Arc<Connection>, &mut HandshakeResponse) + Send + Sync;
type Tick = dyn Fn(i64) + Send + Sync;
type InstanceDestroyed = dyn Fn(SlotId, &CarInstance) + Send + Sync;

struct Registry<F: ?Sized> {
    observers: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Registry<F> {
    fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, observer: Arc<F>) {
        self.observers.write().push(observer);
    }

    /// Copies the list so observers may subscribe while being dispatched.
    fn snapshot(&self) -> Vec<Arc<F>> {
        self.observers.read().clone()
    }

    fn len(&self) -> usize {
        self.observers.read().len()
    }
}

/// Every event the core publishes.
pub struct ServerEvents {
    lifecycle: Registry<Lifecycle>,
    chat_raw: Registry<Chat>,
    chat_message: Registry<Chat>,
    checksum: Registry<Checksum>,
    lap_completed: Registry<Lap>,
    handshake_accepted: Registry<Handshake>,
    pre_tick: Registry<Tick>,
    instance_destroyed: Registry<InstanceDestroyed>,
}

impl Default for ServerEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerEvents {
    pub fn new() -> Self {
        Self {
            lifecycle: Registry::new(),
            chat_raw: Registry::new(),
            chat_message: Registry::new(),
            checksum: Registry::new(),
            lap_completed: Registry::new(),
            handshake_accepted: Registry::new(),
            pre_tick: Registry::new(),
            instance_destroyed: Registry::new(),
        }
    }

    pub fn on_lifecycle(
        &self,
        observer: impl Fn(&Arc<Connection>, &LifecycleEvent) + Send + Sync + 'static,
    ) {
        self.lifecycle.push(Arc::new(observer));
    }

    /// Chat as received, before command handling.
    pub fn on_chat_raw(
        &self,
        observer: impl Fn(&Arc<Connection>, &mut ChatMessage) -> EventFlow + Send + Sync + 'static,
    ) {
        self.chat_raw.push(Arc::new(observer));
    }

    /// Chat that was not consumed as a command, right before broadcast.
    pub fn on_chat_message(
        &self,
        observer: impl Fn(&Arc<Connection>, &mut ChatMessage) -> EventFlow + Send + Sync + 'static,
    ) {
        self.chat_message.push(Arc::new(observer));
    }

    pub fn on_checksum(
        &self,
        observer: impl Fn(&Arc<Connection>, &mut ChecksumVerdict) + Send + Sync + 'static,
    ) {
        self.checksum.push(Arc::new(observer));
    }

    pub fn on_lap_completed(
        &self,
        observer: impl Fn(&Arc<Connection>, &LapCompletedEvent) + Send + Sync + 'static,
    ) {
        self.lap_completed.push(Arc::new(observer));
    }

    pub fn on_handshake_accepted(
        &self,
        observer: impl Fn(&Arc<Connection>, &mut HandshakeResponse) + Send + Sync + 'static,
    ) {
        self.handshake_accepted.push(Arc::new(observer));
    }

    /// Runs at the start of every tick with the server time.
    pub fn on_pre_tick(&self, observer: impl Fn(i64) + Send + Sync + 'static) {
        self.pre_tick.push(Arc::new(observer));
    }

    pub fn on_instance_destroyed(
        &self,
        observer: impl Fn(SlotId, &CarInstance) + Send + Sync + 'static,
    ) {
        self.instance_destroyed.push(Arc::new(observer));
    }

    pub(crate) fn lifecycle(&self, connection: &Arc<Connection>, event: LifecycleEvent) {
        for observer in self.lifecycle.snapshot() {
            observer(connection, &event);
        }
    }

    pub(crate) fn chat_raw(&self, connection: &Arc<Connection>, chat: &mut ChatMessage) -> EventFlow {
        Self::until_cancel(self.chat_raw.snapshot(), connection, chat)
    }

    pub(crate) fn chat_message(
        &self,
        connection: &Arc<Connection>,
        chat: &mut ChatMessage,
    ) -> EventFlow {
        Self::until_cancel(self.chat_message.snapshot(), connection, chat)
    }

    fn until_cancel(
        observers: Vec<Arc<Chat>>,
        connection: &Arc<Connection>,
        chat: &mut ChatMessage,
    ) -> EventFlow {
        for observer in observers {
            if observer(connection, chat) == EventFlow::Cancel {
                return EventFlow::Cancel;
            }
        }
        EventFlow::Continue
    }

    pub(crate) fn checksum(&self, connection: &Arc<Connection>, verdict: &mut ChecksumVerdict) {
        for observer in self.checksum.snapshot() {
            observer(connection, verdict);
        }
    }

    pub(crate) fn lap_completed(&self, connection: &Arc<Connection>, event: &LapCompletedEvent) {
        for observer in self.lap_completed.snapshot() {
            observer(connection, event);
        }
    }

    pub(crate) fn handshake_accepted(
        &self,
        connection: &Arc<Connection>,
        response: &mut HandshakeResponse,
    ) {
        for observer in self.handshake_accepted.snapshot() {
            observer(connection, response);
        }
    }

    pub(crate) fn pre_tick(&self, now_ms: i64) {
        for observer in self.pre_tick.snapshot() {
            observer(now_ms);
        }
    }

    pub(crate) fn instance_destroyed(&self, slot_id: SlotId, instance: &CarInstance) {
        for observer in self.instance_destroyed.snapshot() {
            observer(slot_id, instance);
        }
    }

    /// Number of pre-tick hooks, mostly for diagnostics.
    pub fn pre_tick_hooks(&self) -> usize {
        self.pre_tick.len()
    }
}
