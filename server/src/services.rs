//! External collaborators the core consumes.
//!
//! Persistence of ban and admin lists, weather simulation, chat commands and
//! client message plugins live outside the core. Each is a trait object
//! handed to the server at construction; simple in-memory implementations
//! are provided for tests and for running without plugins.

use crate::connection::Connection;
use log::trace;
use parking_lot::RwLock;
use shared::packets::ChatMessage;
use std::collections::HashSet;
use std::sync::Arc;

/// Identity bans, checked at handshake and on reload.
pub trait BlacklistService: Send + Sync {
    fn is_blacklisted(&self, guid: u64) -> bool;
    fn add(&self, guid: u64);
}

/// Who is an administrator. Admins skip slot filters.
pub trait AdminService: Send + Sync {
    fn is_admin(&self, guid: u64) -> bool;
}

/// Values embedded in handshake and session packets.
pub trait WeatherProvider: Send + Sync {
    fn sun_angle(&self) -> f32;
    fn track_grip(&self) -> f32;
}

/// Chat command dispatcher. Returns true when the message was a command and
/// must not be broadcast.
pub trait ChatCommandHandler: Send + Sync {
    fn try_handle(&self, connection: &Arc<Connection>, message: &ChatMessage) -> bool;
}

/// Receives capability-negotiated client messages.
pub trait ClientMessageHandler: Send + Sync {
    fn on_client_message(&self, connection: &Arc<Connection>, payload: &[u8], reliable: bool);
}

/// In-memory guid set usable as blacklist or admin list.
#[derive(Debug, Default)]
pub struct GuidList {
    guids: RwLock<HashSet<u64>>,
}

impl GuidList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(guids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            guids: RwLock::new(guids.into_iter().collect()),
        }
    }

    pub fn contains(&self, guid: u64) -> bool {
        self.guids.read().contains(&guid)
    }

    pub fn insert(&self, guid: u64) {
        self.guids.write().insert(guid);
    }

    pub fn remove(&self, guid: u64) -> bool {
        self.guids.write().remove(&guid)
    }
}

impl BlacklistService for GuidList {
    fn is_blacklisted(&self, guid: u64) -> bool {
        self.contains(guid)
    }

    fn add(&self, guid: u64) {
        self.insert(guid);
    }
}

impl AdminService for GuidList {
    fn is_admin(&self, guid: u64) -> bool {
        self.contains(guid)
    }
}

/// Weather that only changes when told to.
#[derive(Debug)]
pub struct FixedWeather {
    state: RwLock<(f32, f32)>,
}

impl FixedWeather {
    pub fn new(sun_angle: f32, track_grip: f32) -> Self {
        Self {
            state: RwLock::new((sun_angle, track_grip)),
        }
    }

    pub fn set(&self, sun_angle: f32, track_grip: f32) {
        *self.state.write() = (sun_angle, track_grip);
    }
}

impl WeatherProvider for FixedWeather {
    fn sun_angle(&self) -> f32 {
        self.state.read().0
    }

    fn track_grip(&self) -> f32 {
        self.state.read().1
    }
}

/// Treats nothing as a command.
#[derive(Debug, Default)]
pub struct NoCommands;

impl ChatCommandHandler for NoCommands {
    fn try_handle(&self, _connection: &Arc<Connection>, _message: &ChatMessage) -> bool {
        false
    }
}

/// Drops client messages after logging them.
#[derive(Debug, Default)]
pub struct IgnoreClientMessages;

impl ClientMessageHandler for IgnoreClientMessages {
    fn on_client_message(&self, connection: &Arc<Connection>, payload: &[u8], reliable: bool) {
        trace!(
            "Ignoring {} byte client message from {} (reliable: {})",
            payload.len(),
            connection.name(),
            reliable
        );
    }
}

/// Bundle of collaborators injected into the server.
#[derive(Clone)]
pub struct Services {
    pub blacklist: Arc<dyn BlacklistService>,
    pub admins: Arc<dyn AdminService>,
    pub weather: Arc<dyn WeatherProvider>,
    pub commands: Arc<dyn ChatCommandHandler>,
    pub client_messages: Arc<dyn ClientMessageHandler>,
}

impl Services {
    /// In-memory collaborators seeded from the configured weather values.
    pub fn in_memory(sun_angle: f32, track_grip: f32) -> Self {
        Self {
            blacklist: Arc::new(GuidList::new()),
            admins: Arc::new(GuidList::new()),
            weather: Arc::new(FixedWeather::new(sun_angle, track_grip)),
            commands: Arc::new(NoCommands),
            client_messages: Arc::new(IgnoreClientMessages),
        }
    }
}
