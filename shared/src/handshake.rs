//! Handshake request, acceptance response and typed rejections.

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::packets::{Decode, Encode};
use crate::protocol::PacketId;
use crate::session::SessionConfig;

/// First packet a client sends on a new stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeRequest {
    pub client_version: u16,
    pub guid: u64,
    pub name: String,
    pub team: String,
    pub nation: String,
    pub requested_car: String,
    pub password: String,
    /// Capability features advertised by the client.
    pub features: Vec<String>,
}

impl Decode for HandshakeRequest {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let client_version = reader.read_u16()?;
        let guid = reader.read_u64()?;
        let name = reader.read_utf32()?;
        let team = reader.read_utf8()?;
        let nation = reader.read_utf8()?;
        let requested_car = reader.read_utf8()?;
        let password = reader.read_utf8()?;
        // Older clients stop here.
        let features = if reader.is_empty() {
            Vec::new()
        } else {
            reader
                .read_utf8()?
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect()
        };

        Ok(Self {
            client_version,
            guid,
            name,
            team,
            nation,
            requested_car,
            password,
            features,
        })
    }
}

impl Encode for HandshakeRequest {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::RequestNewConnection.into());
        writer.write_u16(self.client_version);
        writer.write_u64(self.guid);
        writer.write_utf32(&self.name);
        writer.write_utf8(&self.team);
        writer.write_utf8(&self.nation);
        writer.write_utf8(&self.requested_car);
        writer.write_utf8(&self.password);
        writer.write_utf8(&self.features.join(","));
        Ok(())
    }
}

/// Sent once a slot is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub server_name: String,
    pub udp_port: u16,
    pub refresh_rate_hz: u8,
    pub track_name: String,
    pub track_config: String,
    pub car_model: String,
    pub car_skin: String,
    pub sun_angle: f32,
    pub allowed_tyres_out: i16,
    pub tyre_blankets_allowed: bool,
    pub tc_allowed: u8,
    pub abs_allowed: u8,
    pub stability_allowed: bool,
    pub autoclutch_allowed: bool,
    pub jump_start_penalty_mode: u8,
    pub mechanical_damage_rate: f32,
    pub fuel_rate: f32,
    pub tyre_rate: f32,
    pub force_virtual_mirror: bool,
    pub max_contacts_per_km: u8,
    pub race_over_time: u32,
    pub result_screen_time: u32,
    pub has_extra_lap: bool,
    pub gas_penalty_disabled: bool,
    pub pit_window_start: i16,
    pub pit_window_end: i16,
    pub inverted_grid_positions: i16,
    pub slot_id: u8,
    pub sessions: Vec<SessionConfig>,
    pub current_session_index: u8,
    /// Milliseconds since the current session started.
    pub session_time: i64,
    pub checksum_paths: Vec<String>,
    pub legal_tyres: String,
    pub random_seed: u32,
    /// Server clock at the moment the response was built.
    pub server_time: i32,
    pub track_grip: f32,
}

impl Encode for HandshakeResponse {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(PacketId::NewCarConnection.into());
        writer.write_utf32(&self.server_name);
        writer.write_u16(self.udp_port);
        writer.write_u8(self.refresh_rate_hz);
        writer.write_utf8(&self.track_name);
        writer.write_utf8(&self.track_config);
        writer.write_utf8(&self.car_model);
        writer.write_utf8(&self.car_skin);
        writer.write_f32(self.sun_angle);
        writer.write_i16(self.allowed_tyres_out);
        writer.write_bool(self.tyre_blankets_allowed);
        writer.write_u8(self.tc_allowed);
        writer.write_u8(self.abs_allowed);
        writer.write_bool(self.stability_allowed);
        writer.write_bool(self.autoclutch_allowed);
        writer.write_u8(self.jump_start_penalty_mode);
        writer.write_f32(self.mechanical_damage_rate);
        writer.write_f32(self.fuel_rate);
        writer.write_f32(self.tyre_rate);
        writer.write_bool(self.force_virtual_mirror);
        writer.write_u8(self.max_contacts_per_km);
        writer.write_u32(self.race_over_time);
        writer.write_u32(self.result_screen_time);
        writer.write_bool(self.has_extra_lap);
        writer.write_bool(self.gas_penalty_disabled);
        writer.write_i16(self.pit_window_start);
        writer.write_i16(self.pit_window_end);
        writer.write_i16(self.inverted_grid_positions);
        writer.write_u8(self.slot_id);
        writer.write_u8(self.sessions.len() as u8);
        for session in &self.sessions {
            session.write(writer);
        }
        writer.write_u8(self.current_session_index);
        writer.write_i64(self.session_time);
        writer.write_u8(self.checksum_paths.len() as u8);
        for path in &self.checksum_paths {
            writer.write_utf8(path);
        }
        writer.write_utf8(&self.legal_tyres);
        writer.write_u32(self.random_seed);
        writer.write_i32(self.server_time);
        writer.write_f32(self.track_grip);
        Ok(())
    }
}

impl Decode for HandshakeResponse {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let server_name = reader.read_utf32()?;
        let udp_port = reader.read_u16()?;
        let refresh_rate_hz = reader.read_u8()?;
        let track_name = reader.read_utf8()?;
        let track_config = reader.read_utf8()?;
        let car_model = reader.read_utf8()?;
        let car_skin = reader.read_utf8()?;
        let sun_angle = reader.read_f32()?;
        let allowed_tyres_out = reader.read_i16()?;
        let tyre_blankets_allowed = reader.read_bool()?;
        let tc_allowed = reader.read_u8()?;
        let abs_allowed = reader.read_u8()?;
        let stability_allowed = reader.read_bool()?;
        let autoclutch_allowed = reader.read_bool()?;
        let jump_start_penalty_mode = reader.read_u8()?;
        let mechanical_damage_rate = reader.read_f32()?;
        let fuel_rate = reader.read_f32()?;
        let tyre_rate = reader.read_f32()?;
        let force_virtual_mirror = reader.read_bool()?;
        let max_contacts_per_km = reader.read_u8()?;
        let race_over_time = reader.read_u32()?;
        let result_screen_time = reader.read_u32()?;
        let has_extra_lap = reader.read_bool()?;
        let gas_penalty_disabled = reader.read_bool()?;
        let pit_window_start = reader.read_i16()?;
        let pit_window_end = reader.read_i16()?;
        let inverted_grid_positions = reader.read_i16()?;
        let slot_id = reader.read_u8()?;

        let session_count = reader.read_u8()?;
        let mut sessions = Vec::with_capacity(session_count as usize);
        for id in 0..session_count {
            sessions.push(SessionConfig::read(reader, id)?);
        }
        let current_session_index = reader.read_u8()?;
        let session_time = reader.read_i64()?;

        let path_count = reader.read_u8()?;
        let mut checksum_paths = Vec::with_capacity(path_count as usize);
        for _ in 0..path_count {
            checksum_paths.push(reader.read_utf8()?);
        }

        Ok(Self {
            server_name,
            udp_port,
            refresh_rate_hz,
            track_name,
            track_config,
            car_model,
            car_skin,
            sun_angle,
            allowed_tyres_out,
            tyre_blankets_allowed,
            tc_allowed,
            abs_allowed,
            stability_allowed,
            autoclutch_allowed,
            jump_start_penalty_mode,
            mechanical_damage_rate,
            fuel_rate,
            tyre_rate,
            force_virtual_mirror,
            max_contacts_per_km,
            race_over_time,
            result_screen_time,
            has_extra_lap,
            gas_penalty_disabled,
            pit_window_start,
            pit_window_end,
            inverted_grid_positions,
            slot_id,
            sessions,
            current_session_index,
            session_time,
            checksum_paths,
            legal_tyres: reader.read_utf8()?,
            random_seed: reader.read_u32()?,
            server_time: reader.read_i32()?,
            track_grip: reader.read_f32()?,
        })
    }
}

/// Typed refusal of a handshake. Each category has its own tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRejection {
    UnsupportedProtocol { server_version: u16 },
    Blacklisted,
    WrongPassword,
    SessionClosed,
    NoSlotsAvailable,
    AuthFailed(String),
}

impl HandshakeRejection {
    pub fn packet_id(&self) -> PacketId {
        match self {
            HandshakeRejection::UnsupportedProtocol { .. } => PacketId::UnsupportedProtocol,
            HandshakeRejection::Blacklisted => PacketId::BlacklistedResponse,
            HandshakeRejection::WrongPassword => PacketId::WrongPassword,
            HandshakeRejection::SessionClosed => PacketId::SessionClosed,
            HandshakeRejection::NoSlotsAvailable => PacketId::NoSlotsAvailable,
            HandshakeRejection::AuthFailed(_) => PacketId::AuthFailed,
        }
    }

    /// Parses a rejection from a full frame, tag included.
    pub fn from_frame(frame: &[u8]) -> Result<Self, CodecError> {
        let mut reader = PacketReader::new(frame);
        let id = PacketId::try_from(reader.read_u8()?)?;
        Ok(match id {
            PacketId::UnsupportedProtocol => HandshakeRejection::UnsupportedProtocol {
                server_version: reader.read_u16()?,
            },
            PacketId::BlacklistedResponse => HandshakeRejection::Blacklisted,
            PacketId::WrongPassword => HandshakeRejection::WrongPassword,
            PacketId::SessionClosed => HandshakeRejection::SessionClosed,
            PacketId::NoSlotsAvailable => HandshakeRejection::NoSlotsAvailable,
            PacketId::AuthFailed => HandshakeRejection::AuthFailed(reader.read_utf32()?),
            other => {
                return Err(CodecError::UnknownTag {
                    family: "HandshakeRejection",
                    tag: other.into(),
                })
            }
        })
    }
}

impl Encode for HandshakeRejection {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(self.packet_id().into());
        match self {
            HandshakeRejection::UnsupportedProtocol { server_version } => {
                writer.write_u16(*server_version)
            }
            HandshakeRejection::AuthFailed(reason) => writer.write_utf32(reason),
            _ => {}
        }
        Ok(())
    }
}
