//! # Racing Server Library
//!
//! Core of a dedicated multiplayer racing server. It admits clients over a
//! reliable stream, verifies their content, assigns them car slots, collects
//! their telemetry over datagrams and fans every car's state back out at a
//! fixed tick rate, while tracking sessions, laps and standings.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Each client opens one TCP stream and sends a handshake. The server checks
//! protocol version, bans, passwords, session state, name and capability
//! features, runs the slot filter chain and binds a free slot for the
//! requested car model. The client is then asked to prove its content files
//! match the server's by sending checksums.
//!
//! ### Telemetry Relay
//! Clients stream position updates over UDP. The server applies them to the
//! car of the sender's slot and, every tick, sends each in-game client the
//! cars that changed, with timestamps shifted into that client's clock.
//!
//! ### Session Timing
//! Sessions (practice, qualifying, race) rotate on time or laps. Lap reports
//! are validated, folded into per-car results and rebroadcast as standings.
//!
//! ### Moderation
//! Kicks, bans, high-ping and AFK detection all go through one removal path
//! that notifies everyone and releases the slot.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! One tick task, one datagram task, one accept task, and two tasks per
//! connection (receive and send). Shared state lives in [`context::ServerContext`]
//! behind an `Arc`; critical sections are short and never held across an
//! await.
//!
//! ### Non-blocking Sends
//! Every outbound reliable packet goes through a bounded per-connection
//! queue. A full queue drops low-priority packets and disconnects the
//! connection for anything else, so a slow client can never stall the tick.
//!
//! ### Observer Hooks
//! [`events::ServerEvents`] lets embedders watch or veto chat, override
//! checksum verdicts, rewrite handshake responses and react to lifecycle
//! changes without touching the core.
//!
//! ## Module Organization
//!
//! - [`config`]: validated server configuration
//! - [`error`]: error taxonomy
//! - [`clock`]: monotonic server clock
//! - [`events`]: observer registries
//! - [`services`]: external collaborators (bans, admins, weather, commands)
//! - [`checksum`]: content checksum manifest
//! - [`slots`] and [`filters`]: car slots and admission filters
//! - [`session`]: session rotation, lap timing and standings
//! - [`connection`] and [`handshake`]: per-client state machine and admission
//! - [`datagram`]: UDP dispatch
//! - [`broadcast`]: tick loop and position fan-out
//! - [`context`]: shared state and cross-connection operations
//! - [`network`]: socket bootstrap
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let services = Services::in_memory(config.sun_angle, config.track_grip);
//!
//!     // Binds TCP and UDP on the configured ports.
//!     let server = Server::bind(config, services).await?;
//!
//!     // Runs until `server.shutdown()` is called.
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod datagram;
pub mod error;
pub mod events;
pub mod filters;
pub mod handshake;
pub mod network;
pub mod services;
pub mod session;
pub mod slots;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::ServerError;
pub use network::Server;
