//! Packet structs for both channels.
//!
//! Every outgoing packet implements [`Encode`], which writes the tag byte
//! followed by the fields. Incoming packets implement [`Decode`], which reads
//! the fields after the caller has consumed and dispatched on the tag.

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::protocol::{ExtendedTcpId, ExtendedUdpId, KickReason, PacketId};
use crate::session::SessionConfig;
use crate::telemetry::{PositionUpdateIn, PositionUpdateOut};

/// Writes a packet, tag first.
pub trait Encode {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError>;

    /// Low-priority packets may be discarded when an outbound queue is full.
    fn is_droppable(&self) -> bool {
        false
    }
}

/// Reads a packet body; the tag has already been consumed.
pub trait Decode: Sized {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// Encodes a packet into a fresh buffer.
pub fn to_bytes<P: Encode + ?Sized>(packet: &P) -> Result<Vec<u8>, CodecError> {
    let mut writer = PacketWriter::with_capacity(64);
    packet.encode(&mut writer)?;
    Ok(writer.into_bytes())
}

/// Number of damage zones reported per car.
pub const DAMAGE_ZONES: usize = 5;

/// Cars listed per `CarList` page.
pub const CAR_LIST_PAGE_SIZE: usize = 10;

/// Chat line. Sent by clients with their own slot id and relayed unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub slot_id: u8,
    pub message: String,
}

impl Encode for ChatMessage {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Chat.into());
        writer.write_u8(self.slot_id);
        writer.write_utf32(&self.message);
        Ok(())
    }
}

impl Decode for ChatMessage {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
            message: reader.read_utf32()?,
        })
    }
}

/// Lap report from the driving client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapCompletedIn {
    pub timestamp: u32,
    pub lap_time: u32,
    pub cuts: u8,
}

impl Decode for LapCompletedIn {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            timestamp: reader.read_u32()?,
            lap_time: reader.read_u32()?,
            cuts: reader.read_u8()?,
        })
    }
}

impl Encode for LapCompletedIn {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::LapCompleted.into());
        writer.write_u32(self.timestamp);
        writer.write_u32(self.lap_time);
        writer.write_u8(self.cuts);
        Ok(())
    }
}

/// One row of the standings attached to a lap broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapStanding {
    pub slot_id: u8,
    /// Total time in races, best lap otherwise.
    pub lap_time: u32,
    pub num_laps: u16,
    pub has_completed_last_lap: bool,
}

/// Lap broadcast with the full standings.
///
/// A `slot_id` of [`LapCompletedOut::STANDINGS_ONLY`] carries standings
/// without announcing a new lap.
#[derive(Debug, Clone, PartialEq)]
pub struct LapCompletedOut {
    pub slot_id: u8,
    pub lap_time: u32,
    pub cuts: u8,
    pub standings: Vec<LapStanding>,
    pub track_grip: f32,
}

impl LapCompletedOut {
    pub const STANDINGS_ONLY: u8 = 0xFF;
}

impl Encode for LapCompletedOut {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::LapCompleted.into());
        writer.write_u8(self.slot_id);
        writer.write_u32(self.lap_time);
        writer.write_u8(self.cuts);
        writer.write_u8(self.standings.len() as u8);
        for row in &self.standings {
            writer.write_u8(row.slot_id);
            writer.write_u32(row.lap_time);
            writer.write_u16(row.num_laps);
            writer.write_bool(row.has_completed_last_lap);
        }
        writer.write_f32(self.track_grip);
        Ok(())
    }
}

impl Decode for LapCompletedOut {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let slot_id = reader.read_u8()?;
        let lap_time = reader.read_u32()?;
        let cuts = reader.read_u8()?;
        let count = reader.read_u8()?;
        let mut standings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            standings.push(LapStanding {
                slot_id: reader.read_u8()?,
                lap_time: reader.read_u32()?,
                num_laps: reader.read_u16()?,
                has_completed_last_lap: reader.read_bool()?,
            });
        }
        Ok(Self {
            slot_id,
            lap_time,
            cuts,
            standings,
            track_grip: reader.read_f32()?,
        })
    }
}

fn read_damage(reader: &mut PacketReader<'_>) -> Result<[f32; DAMAGE_ZONES], CodecError> {
    let mut levels = [0.0; DAMAGE_ZONES];
    for level in levels.iter_mut() {
        *level = reader.read_f32()?;
    }
    Ok(levels)
}

/// Damage report from the driving client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageUpdateIn {
    pub damage_zone_level: [f32; DAMAGE_ZONES],
}

impl Decode for DamageUpdateIn {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            damage_zone_level: read_damage(reader)?,
        })
    }
}

/// Damage relayed to the other clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageUpdate {
    pub slot_id: u8,
    pub damage_zone_level: [f32; DAMAGE_ZONES],
}

impl Encode for DamageUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::DamageUpdate.into());
        writer.write_u8(self.slot_id);
        for level in self.damage_zone_level {
            writer.write_f32(level);
        }
        Ok(())
    }
}

/// Tyre change from the driving client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TyreCompoundChange {
    pub compound: String,
}

impl Decode for TyreCompoundChange {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            compound: reader.read_utf8()?,
        })
    }
}

/// Tyre compound relayed to every client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TyreCompoundUpdate {
    pub slot_id: u8,
    pub compound: String,
}

impl Encode for TyreCompoundUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::TyreCompoundChange.into());
        writer.write_u8(self.slot_id);
        writer.write_utf8(&self.compound);
        Ok(())
    }
}

/// Extended request to watch another car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectateCar {
    pub slot_id: u8,
}

impl Decode for SpectateCar {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
        })
    }
}

impl Encode for SpectateCar {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Extended.into());
        writer.write_u8(ExtendedTcpId::SpectateCar.into());
        writer.write_u8(self.slot_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarListRequest {
    pub page_index: u8,
}

impl Decode for CarListRequest {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            page_index: reader.read_u8()?,
        })
    }
}

impl Encode for CarListRequest {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CarListRequest.into());
        writer.write_u8(self.page_index);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarListEntry {
    pub slot_id: u8,
    pub model: String,
    pub skin: String,
    pub driver_name: String,
    pub driver_team: String,
    pub driver_nation: String,
    pub is_spectator: bool,
    pub damage_zone_level: [f32; DAMAGE_ZONES],
}

/// One page of the entry list.
#[derive(Debug, Clone, PartialEq)]
pub struct CarListResponse {
    pub page_index: u8,
    pub entries: Vec<CarListEntry>,
}

impl Encode for CarListResponse {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CarList.into());
        writer.write_u8(self.page_index);
        writer.write_u8(self.entries.len() as u8);
        for entry in &self.entries {
            writer.write_u8(entry.slot_id);
            writer.write_utf8(&entry.model);
            writer.write_utf8(&entry.skin);
            writer.write_utf32(&entry.driver_name);
            writer.write_utf32(&entry.driver_team);
            writer.write_utf8(&entry.driver_nation);
            writer.write_bool(entry.is_spectator);
            for level in entry.damage_zone_level {
                writer.write_f32(level);
            }
        }
        Ok(())
    }
}

impl Decode for CarListResponse {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let page_index = reader.read_u8()?;
        let count = reader.read_u8()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(CarListEntry {
                slot_id: reader.read_u8()?,
                model: reader.read_utf8()?,
                skin: reader.read_utf8()?,
                driver_name: reader.read_utf32()?,
                driver_team: reader.read_utf32()?,
                driver_nation: reader.read_utf8()?,
                is_spectator: reader.read_bool()?,
                damage_zone_level: read_damage(reader)?,
            });
        }
        Ok(Self {
            page_index,
            entries,
        })
    }
}

/// Announces a driver who passed the checksum check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarConnected {
    pub slot_id: u8,
    pub name: String,
    pub nation: String,
}

impl Encode for CarConnected {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CarConnected.into());
        writer.write_u8(self.slot_id);
        writer.write_utf32(&self.name);
        writer.write_utf32(&self.nation);
        Ok(())
    }
}

impl Decode for CarConnected {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
            name: reader.read_utf32()?,
            nation: reader.read_utf32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarDisconnected {
    pub slot_id: u8,
}

impl Encode for CarDisconnected {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CarDisconnected.into());
        writer.write_u8(self.slot_id);
        Ok(())
    }
}

impl Decode for CarDisconnected {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickCar {
    pub slot_id: u8,
    pub reason: KickReason,
}

impl Encode for KickCar {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::KickCar.into());
        writer.write_u8(self.slot_id);
        writer.write_u8(self.reason.into());
        Ok(())
    }
}

impl Decode for KickCar {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
            reason: KickReason::try_from(reader.read_u8()?)?,
        })
    }
}

/// Text shown to a kicked or banned driver in place of the stock message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickBanMessage {
    pub message: String,
}

impl Encode for KickBanMessage {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Extended.into());
        writer.write_u8(ExtendedTcpId::KickBanMessage.into());
        writer.write_utf32(&self.message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub message: String,
}

impl Encode for WelcomeMessage {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::WelcomeMessage.into());
        writer.write_utf32(&self.message);
        Ok(())
    }
}

/// Full description of the running session.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSessionUpdate {
    pub session: SessionConfig,
    pub track_grip: f32,
    /// Slot ids in starting order.
    pub grid: Vec<u8>,
    /// Session start in the recipient's clock.
    pub start_time: i64,
}

impl Encode for CurrentSessionUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CurrentSessionUpdate.into());
        writer.write_utf32(&self.session.name);
        writer.write_u8(self.session.id);
        self.session.write(writer);
        writer.write_f32(self.track_grip);
        writer.write_u8(self.grid.len() as u8);
        writer.write_bytes(&self.grid);
        writer.write_i64(self.start_time);
        Ok(())
    }
}

impl Decode for CurrentSessionUpdate {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let name = reader.read_utf32()?;
        let id = reader.read_u8()?;
        let session = SessionConfig {
            name,
            ..SessionConfig::read(reader, id)?
        };
        let track_grip = reader.read_f32()?;
        let grid_len = reader.read_u8()? as usize;
        let grid = reader.read_bytes(grid_len)?.to_vec();
        Ok(Self {
            session,
            track_grip,
            grid,
            start_time: reader.read_i64()?,
        })
    }
}

/// Sun position push. Stale values are worthless, so these may be dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunAngleUpdate {
    pub sun_angle: f32,
}

impl Encode for SunAngleUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::SunAngleUpdate.into());
        writer.write_f32(self.sun_angle);
        Ok(())
    }

    fn is_droppable(&self) -> bool {
        true
    }
}

/// Datagram binding the sender's address to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarConnect {
    pub slot_id: u8,
}

impl Encode for CarConnect {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CarConnect.into());
        writer.write_u8(self.slot_id);
        Ok(())
    }
}

impl Decode for CarConnect {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot_id: reader.read_u8()?,
        })
    }
}

/// Reply to a lobby query: the tag followed by the HTTP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyCheckResponse {
    pub http_port: u16,
}

impl Encode for LobbyCheckResponse {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::LobbyCheck.into());
        writer.write_u16(self.http_port);
        Ok(())
    }
}

/// Pong datagram: the server time being echoed and the client's own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    pub server_time: u32,
    pub client_time: u32,
}

impl Encode for PingPong {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::PingPong.into());
        writer.write_u32(self.server_time);
        writer.write_u32(self.client_time);
        Ok(())
    }
}

impl Decode for PingPong {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            server_time: reader.read_u32()?,
            client_time: reader.read_u32()?,
        })
    }
}

/// Ping datagram carrying the server time to echo and the last measured ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingUpdate {
    pub server_time: u32,
    pub ping: u16,
}

impl Encode for PingUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::PingUpdate.into());
        writer.write_u32(self.server_time);
        writer.write_u16(self.ping);
        Ok(())
    }
}

impl Decode for PingUpdate {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            server_time: reader.read_u32()?,
            ping: reader.read_u16()?,
        })
    }
}

/// Datagram carrying the session type the client believes is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub session_type: u8,
}

impl Decode for SessionRequest {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_type: reader.read_u8()?,
        })
    }
}

impl Encode for SessionRequest {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::SessionRequest.into());
        writer.write_u8(self.session_type);
        Ok(())
    }
}

/// A single car update in the plain format every client understands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyPositionUpdate<'a>(pub &'a PositionUpdateOut);

impl Encode for LegacyPositionUpdate<'_> {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::PositionUpdate.into());
        writer.write_struct(self.0)
    }
}

/// Several car updates in one datagram, for clients that negotiated it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchedPositionUpdate<'a> {
    pub entries: &'a [PositionUpdateOut],
}

impl Encode for BatchedPositionUpdate<'_> {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Extended.into());
        writer.write_u8(ExtendedUdpId::BatchedPositionUpdate.into());
        writer.write_u8(self.entries.len() as u8);
        for entry in self.entries {
            writer.write_struct(entry)?;
        }
        Ok(())
    }
}

/// Decodes the entries of a batched update datagram, tag and sub-tag included.
pub fn decode_batched(frame: &[u8]) -> Result<Vec<PositionUpdateOut>, CodecError> {
    let mut reader = PacketReader::new(frame);
    let tag = reader.read_u8()?;
    let sub = reader.read_u8()?;
    if tag != u8::from(PacketId::Extended)
        || ExtendedUdpId::try_from(sub)? != ExtendedUdpId::BatchedPositionUpdate
    {
        return Err(CodecError::UnknownTag {
            family: "BatchedPositionUpdate",
            tag,
        });
    }
    let count = reader.read_u8()?;
    (0..count).map(|_| reader.read_struct()).collect()
}

/// Telemetry datagram sent by a driving client every physics step.
impl Encode for PositionUpdateIn {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::PositionUpdate.into());
        writer.write_struct(self)
    }
}

impl Decode for PositionUpdateIn {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_struct()
    }
}

/// Checksum answer: track hashes in manifest order, then the car data hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    pub payload: Vec<u8>,
}

impl Encode for ChecksumReport {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Checksum.into());
        writer.write_bytes(&self.payload);
        Ok(())
    }
}

impl Decode for ChecksumReport {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            payload: reader.rest().to_vec(),
        })
    }
}

/// The driver left the car and is about to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanExitDrive;

impl Encode for CleanExitDrive {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::CleanExitDrive.into());
        Ok(())
    }
}

/// Lobby query datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyCheck;

impl Encode for LobbyCheck {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::LobbyCheck.into());
        Ok(())
    }
}

impl Decode for LobbyCheckResponse {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            http_port: reader.read_u16()?,
        })
    }
}

/// Opaque capability-negotiated message, on either channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub reliable: bool,
    pub payload: Vec<u8>,
}

impl Encode for ClientMessage {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::Extended.into());
        if self.reliable {
            writer.write_u8(ExtendedTcpId::ClientMessage.into());
        } else {
            writer.write_u8(ExtendedUdpId::ClientMessage.into());
        }
        writer.write_bytes(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn chat_relays_slot_and_text() {
        let chat = ChatMessage {
            slot_id: 4,
            message: "gg".into(),
        };
        let bytes = to_bytes(&chat).unwrap();
        assert_eq!(bytes[0], u8::from(PacketId::Chat));
        let decoded = ChatMessage::decode(&mut PacketReader::new(&bytes[1..])).unwrap();
        assert_eq!(decoded, chat);
    }

    #[test]
    fn lap_broadcast_keeps_standings_order() {
        let packet = LapCompletedOut {
            slot_id: 2,
            lap_time: 95_000,
            cuts: 0,
            standings: vec![
                LapStanding {
                    slot_id: 2,
                    lap_time: 95_000,
                    num_laps: 3,
                    has_completed_last_lap: false,
                },
                LapStanding {
                    slot_id: 0,
                    lap_time: 97_500,
                    num_laps: 3,
                    has_completed_last_lap: true,
                },
            ],
            track_grip: 0.98,
        };
        let bytes = to_bytes(&packet).unwrap();
        let decoded = LapCompletedOut::decode(&mut PacketReader::new(&bytes[1..])).unwrap();
        assert_eq!(decoded.standings, packet.standings);
        assert_approx_eq!(decoded.track_grip, 0.98);
    }

    #[test]
    fn only_sun_angle_is_droppable() {
        assert!(SunAngleUpdate { sun_angle: 12.0 }.is_droppable());
        assert!(!CarDisconnected { slot_id: 1 }.is_droppable());
        assert!(!ChatMessage {
            slot_id: 1,
            message: String::new()
        }
        .is_droppable());
    }

    #[test]
    fn lobby_reply_is_three_bytes() {
        let bytes = to_bytes(&LobbyCheckResponse { http_port: 8081 }).unwrap();
        assert_eq!(bytes, vec![0xC8, 0x91, 0x1F]);
    }

    #[test]
    fn batched_update_decodes_every_entry() {
        let entries: Vec<PositionUpdateOut> = (0..3)
            .map(|i| PositionUpdateOut {
                session_id: i,
                engine_rpm: 1000 * i as u16,
                ..Default::default()
            })
            .collect();
        let bytes = to_bytes(&BatchedPositionUpdate { entries: &entries }).unwrap();
        let decoded = decode_batched(&bytes).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn session_update_carries_grid_and_start() {
        let packet = CurrentSessionUpdate {
            session: SessionConfig::qualifying(1, 15),
            track_grip: 1.0,
            grid: vec![3, 0, 1],
            start_time: -2_500,
        };
        let bytes = to_bytes(&packet).unwrap();
        let decoded = CurrentSessionUpdate::decode(&mut PacketReader::new(&bytes[1..])).unwrap();
        assert_eq!(decoded.session.name, "Qualify");
        assert_eq!(decoded.session.time_minutes, 15);
        assert_eq!(decoded.grid, vec![3, 0, 1]);
        assert_eq!(decoded.start_time, -2_500);
    }

    #[test]
    fn checksum_report_carries_raw_hashes() {
        let report = ChecksumReport {
            payload: vec![7; 32],
        };
        let bytes = to_bytes(&report).unwrap();
        assert_eq!(bytes[0], u8::from(PacketId::Checksum));
        assert_eq!(bytes.len(), 33);
        let decoded = ChecksumReport::decode(&mut PacketReader::new(&bytes[1..])).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn telemetry_datagram_has_fixed_layout() {
        let update = PositionUpdateIn {
            gear: 3,
            engine_rpm: 6_500,
            ..Default::default()
        };
        let bytes = to_bytes(&update).unwrap();
        assert_eq!(bytes[0], u8::from(PacketId::PositionUpdate));
        assert_eq!(bytes.len(), 1 + 61);
        let decoded = PositionUpdateIn::decode(&mut PacketReader::new(&bytes[1..])).unwrap();
        assert_eq!(decoded.gear, 3);
        assert_eq!(decoded.engine_rpm, 6_500);
    }
}
