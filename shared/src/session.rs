//! Session configuration shared by the handshake and session packets.

use crate::codec::{CodecError, PacketReader, PacketWriter};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionType {
    Practice = 1,
    Qualifying = 2,
    Race = 3,
}

impl TryFrom<u8> for SessionType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SessionType::Practice),
            2 => Ok(SessionType::Qualifying),
            3 => Ok(SessionType::Race),
            tag => Err(CodecError::UnknownTag {
                family: "SessionType",
                tag,
            }),
        }
    }
}

/// Immutable description of one session in the rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: u8,
    pub session_type: SessionType,
    pub name: String,
    /// Time limit in minutes, 0 when the session is lap-limited.
    pub time_minutes: u32,
    /// Lap target, 0 when the session is time-limited.
    pub laps: u32,
    /// Seconds the grid waits before the start.
    pub wait_time_secs: u32,
    /// Whether new drivers may join while this session runs.
    pub is_open: bool,
    /// Infinite sessions never time out.
    pub infinite: bool,
}

impl SessionConfig {
    pub fn practice(id: u8, time_minutes: u32) -> Self {
        Self {
            id,
            session_type: SessionType::Practice,
            name: "Practice".into(),
            time_minutes,
            laps: 0,
            wait_time_secs: 0,
            is_open: true,
            infinite: false,
        }
    }

    pub fn qualifying(id: u8, time_minutes: u32) -> Self {
        Self {
            session_type: SessionType::Qualifying,
            name: "Qualify".into(),
            ..Self::practice(id, time_minutes)
        }
    }

    pub fn race(id: u8, laps: u32, time_minutes: u32) -> Self {
        Self {
            session_type: SessionType::Race,
            name: "Race".into(),
            laps,
            wait_time_secs: 60,
            ..Self::practice(id, time_minutes)
        }
    }

    /// A race that ends on time rather than on a lap target.
    pub fn is_timed_race(&self) -> bool {
        self.time_minutes > 0 && self.laps == 0
    }

    pub fn time_ms(&self) -> i64 {
        self.time_minutes as i64 * 60_000
    }

    pub fn write(&self, writer: &mut PacketWriter) {
        writer.write_u8(self.session_type as u8);
        writer.write_u16(self.laps.min(u16::MAX as u32) as u16);
        writer.write_u16(self.time_minutes.min(u16::MAX as u32) as u16);
    }

    /// Reads the compact form used inside the handshake session list.
    pub fn read(reader: &mut PacketReader<'_>, id: u8) -> Result<Self, CodecError> {
        let session_type = SessionType::try_from(reader.read_u8()?)?;
        let laps = reader.read_u16()? as u32;
        let time_minutes = reader.read_u16()? as u32;
        let base = match session_type {
            SessionType::Practice => Self::practice(id, time_minutes),
            SessionType::Qualifying => Self::qualifying(id, time_minutes),
            SessionType::Race => Self::race(id, laps, time_minutes),
        };
        Ok(Self { laps, ..base })
    }
}
