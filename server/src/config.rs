//! Server configuration.
//!
//! The core never reads files itself: a fully populated [`ServerConfig`] is
//! built by the binary (defaults plus command-line overrides) or by tests, run
//! through [`ServerConfig::validate`] and injected into the server. All values
//! implement `serde::Deserialize` so an outer loader can fill them from any
//! format it likes.

use serde::Deserialize;
use shared::SessionConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems that stop the server from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one session must be configured")]
    NoSessions,

    #[error("at least one entry must be configured")]
    NoEntries,

    #[error("{0} entries configured, the protocol addresses at most 255 slots")]
    TooManyEntries(usize),

    #[error("refresh rate {0} Hz is outside 1..=255")]
    InvalidRefreshRate(u16),

    #[error("server password and admin password must differ")]
    PasswordClash,

    #[error("no checksum data for car models: {}", .0.join(", "))]
    MissingCarChecksums(Vec<String>),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What counts as activity for AFK detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AfkKickBehavior {
    /// Chat or driving inputs reset the timer.
    PlayerInput,
    /// Only driving above a minimum speed resets the timer.
    MinimumSpeed,
}

/// Driving aids and rates advertised in the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistRules {
    pub abs_allowed: u8,
    pub tc_allowed: u8,
    pub stability_allowed: bool,
    pub autoclutch_allowed: bool,
    pub tyre_blankets_allowed: bool,
    pub force_virtual_mirror: bool,
    pub allowed_tyres_out: i16,
    pub jump_start_penalty_mode: u8,
    pub mechanical_damage_rate: f32,
    pub fuel_rate: f32,
    pub tyre_rate: f32,
    pub max_contacts_per_km: u8,
}

impl Default for AssistRules {
    fn default() -> Self {
        Self {
            abs_allowed: 1,
            tc_allowed: 1,
            stability_allowed: false,
            autoclutch_allowed: true,
            tyre_blankets_allowed: true,
            force_virtual_mirror: false,
            allowed_tyres_out: 2,
            jump_start_penalty_mode: 1,
            mechanical_damage_rate: 1.0,
            fuel_rate: 1.0,
            tyre_rate: 1.0,
            max_contacts_per_km: u8::MAX,
        }
    }
}

/// One slot in the entry list.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    pub model: String,
    pub skin: String,
    pub ballast: u32,
    pub restrictor: u32,
    /// Bit flags forwarded to the client untouched.
    pub driver_options: u8,
    /// AI slots never accept a client.
    pub ai: bool,
    /// When non-empty, only these guids may take the slot.
    pub allowed_guids: Vec<u64>,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            model: "ks_mazda_mx5_cup".into(),
            skin: String::new(),
            ballast: 0,
            restrictor: 0,
            driver_options: 0,
            ai: false,
            allowed_guids: Vec::new(),
        }
    }
}

impl EntryConfig {
    pub fn client(model: &str) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn ai(model: &str) -> Self {
        Self {
            model: model.into(),
            ai: true,
            ..Default::default()
        }
    }
}

/// Tunables that go beyond the stock server options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtraConfig {
    /// Allow batched position updates for clients that advertise them.
    pub enable_custom_update: bool,
    pub mandatory_client_security_level: i32,
    /// Features every client must advertise in its handshake.
    pub mandatory_client_features: Vec<String>,
    /// Ceiling for measured ping, in milliseconds.
    pub max_ping_ms: u16,
    /// How long ping may stay above the ceiling before a kick.
    pub max_ping_seconds: u32,
    pub player_loading_timeout_minutes: u32,
    pub player_checksum_timeout_seconds: u32,
    pub enable_anti_afk: bool,
    pub max_afk_time_minutes: u32,
    pub afk_kick_behavior: AfkKickBehavior,
    pub enable_udp_client_messages: bool,
    pub welcome_message: String,
    pub outbound_queue_capacity: usize,
    /// Downgrade missing car checksums from a startup error to a warning.
    pub ignore_missing_car_checksums: bool,
    /// Root of the content tree used to build the checksum manifest.
    pub content_root: Option<PathBuf>,
    pub ai_instances_per_slot: usize,
    /// AI slots refuse new clients once this many drivers are connected; 0 disables.
    pub ai_max_player_count: usize,
    /// Display names containing any of these words are refused.
    pub banned_name_words: Vec<String>,
}

impl Default for ExtraConfig {
    fn default() -> Self {
        Self {
            enable_custom_update: true,
            mandatory_client_security_level: 0,
            mandatory_client_features: Vec::new(),
            max_ping_ms: 500,
            max_ping_seconds: 10,
            player_loading_timeout_minutes: 10,
            player_checksum_timeout_seconds: 60,
            enable_anti_afk: false,
            max_afk_time_minutes: 10,
            afk_kick_behavior: AfkKickBehavior::PlayerInput,
            enable_udp_client_messages: false,
            welcome_message: String::new(),
            outbound_queue_capacity: 512,
            ignore_missing_car_checksums: false,
            content_root: None,
            ai_instances_per_slot: 1,
            ai_max_player_count: 0,
            banned_name_words: Vec::new(),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub http_port: u16,
    pub refresh_rate_hz: u16,
    pub password: Option<String>,
    pub admin_password: Option<String>,
    pub track: String,
    pub track_config: String,
    pub legal_tyres: String,
    pub sun_angle: f32,
    pub track_grip: f32,
    pub race_over_time_secs: u32,
    pub result_screen_time_secs: u32,
    pub has_extra_lap: bool,
    pub gas_penalty_disabled: bool,
    pub pit_window_start: i16,
    pub pit_window_end: i16,
    pub inverted_grid_positions: i16,
    pub assists: AssistRules,
    pub sessions: Vec<SessionConfig>,
    pub entries: Vec<EntryConfig>,
    pub extra: ExtraConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Racing Server".into(),
            host: "0.0.0.0".into(),
            tcp_port: 9600,
            udp_port: 9600,
            http_port: 8081,
            refresh_rate_hz: 18,
            password: None,
            admin_password: None,
            track: "ks_vallelunga".into(),
            track_config: String::new(),
            legal_tyres: "V;E;HR;ST".into(),
            sun_angle: 16.0,
            track_grip: 1.0,
            race_over_time_secs: 60,
            result_screen_time_secs: 60,
            has_extra_lap: false,
            gas_penalty_disabled: false,
            pit_window_start: -1,
            pit_window_end: -1,
            inverted_grid_positions: 0,
            assists: AssistRules::default(),
            sessions: vec![
                SessionConfig::practice(0, 10),
                SessionConfig::qualifying(1, 10),
                SessionConfig::race(2, 5, 0),
            ],
            entries: (0..8).map(|_| EntryConfig::default()).collect(),
            extra: ExtraConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Checks the cross-field rules the rest of the server relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.is_empty() {
            return Err(ConfigError::NoSessions);
        }
        if self.entries.is_empty() {
            return Err(ConfigError::NoEntries);
        }
        if self.entries.len() > u8::MAX as usize {
            return Err(ConfigError::TooManyEntries(self.entries.len()));
        }
        if self.refresh_rate_hz == 0 || self.refresh_rate_hz > u8::MAX as u16 {
            return Err(ConfigError::InvalidRefreshRate(self.refresh_rate_hz));
        }
        if let (Some(password), Some(admin)) = (&self.password, &self.admin_password) {
            if !password.is_empty() && password == admin {
                return Err(ConfigError::PasswordClash);
            }
        }
        Ok(())
    }

    pub fn max_slots(&self) -> usize {
        self.entries.len()
    }

    /// Duration of one tick.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(1000 / self.refresh_rate_hz.max(1) as u64)
    }

    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.extra.player_loading_timeout_minutes as u64 * 60)
    }

    pub fn checksum_timeout(&self) -> Duration {
        Duration::from_secs(self.extra.player_checksum_timeout_seconds as u64)
    }

    /// Distinct car models across all entries, in entry order.
    pub fn car_models(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !models.contains(&entry.model) {
                models.push(entry.model.clone());
            }
        }
        models
    }
}
