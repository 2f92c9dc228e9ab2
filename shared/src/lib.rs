//! # Shared Protocol Crate
//!
//! Wire protocol used between the racing server and its game clients. Both
//! the server and the headless test client depend on this crate so the two
//! sides can never disagree on a byte.
//!
//! ## Channels
//!
//! ### Reliable stream
//! One TCP stream per client. Each message is a length-prefixed frame
//! ([`framing`]) whose first payload byte is a [`protocol::PacketId`].
//!
//! ### Datagrams
//! One shared UDP socket on the server. Datagrams are not framed; the first
//! byte is the tag. Telemetry travels here.
//!
//! ## Modules
//! - [`codec`]: little-endian reader/writer and fixed-layout struct support
//! - [`framing`]: async frame read/write for the reliable stream
//! - [`protocol`]: tag tables
//! - [`handshake`]: connection request, acceptance and rejections
//! - [`packets`]: every other packet on either channel
//! - [`telemetry`]: car state value types
//! - [`session`]: session descriptions

pub mod codec;
pub mod framing;
pub mod handshake;
pub mod packets;
pub mod protocol;
pub mod session;
pub mod telemetry;

pub use codec::{CodecError, PacketReader, PacketWriter};
pub use packets::{to_bytes, Decode, Encode};
pub use protocol::{ExtendedTcpId, ExtendedUdpId, KickReason, PacketId};
pub use session::{SessionConfig, SessionType};
pub use telemetry::{CarStatus, PositionUpdateIn, PositionUpdateOut, Vector3};

/// Protocol version the server speaks.
pub const PROTOCOL_VERSION: u16 = 202;

/// Longest display name kept after the handshake, in characters.
pub const MAX_NAME_LENGTH: usize = 25;

/// Car updates per outbound datagram.
pub const POSITION_BATCH_SIZE: usize = 20;

/// Slot id used for messages from the server itself.
pub const SERVER_SLOT_ID: u8 = 0xFF;

/// Receive buffer size for datagrams.
pub const MAX_DATAGRAM_SIZE: usize = 1500;
