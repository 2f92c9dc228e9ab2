//! Packet type tags for the reliable and unreliable channels.
//!
//! Every message on either channel starts with a one-byte [`PacketId`].
//! Messages tagged [`PacketId::Extended`] carry a second byte selecting a
//! capability-negotiated family: [`ExtendedTcpId`] on the stream,
//! [`ExtendedUdpId`] on datagrams.

use crate::codec::CodecError;

/// Implements `TryFrom<u8>` for a fieldless `#[repr(u8)]` tag enum.
macro_rules! tag_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident = $value:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        $vis enum $name {
            $($variant = $value,)+
        }

        impl TryFrom<u8> for $name {
            type Error = CodecError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(CodecError::UnknownTag {
                        family: stringify!($name),
                        tag: other,
                    }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(id: $name) -> u8 {
                id as u8
            }
        }
    };
}

tag_enum! {
    /// First byte of every packet.
    pub enum PacketId {
        BlacklistedResponse = 0x3B,
        WrongPassword = 0x3C,
        RequestNewConnection = 0x3D,
        NewCarConnection = 0x3E,
        CarListRequest = 0x3F,
        CarList = 0x40,
        UnsupportedProtocol = 0x42,
        CleanExitDrive = 0x43,
        Checksum = 0x44,
        NoSlotsAvailable = 0x45,
        PositionUpdate = 0x46,
        Chat = 0x47,
        LapCompleted = 0x49,
        CurrentSessionUpdate = 0x4A,
        CarDisconnected = 0x4D,
        CarConnect = 0x4E,
        SessionRequest = 0x4F,
        TyreCompoundChange = 0x50,
        WelcomeMessage = 0x51,
        SunAngleUpdate = 0x54,
        DamageUpdate = 0x56,
        CarConnected = 0x5A,
        KickCar = 0x68,
        SessionClosed = 0x6E,
        AuthFailed = 0x6F,
        ClientEvent = 0x82,
        Extended = 0xAB,
        LobbyCheck = 0xC8,
        PingPong = 0xF8,
        PingUpdate = 0xF9,
    }
}

tag_enum! {
    /// Sub-tag following [`PacketId::Extended`] on the reliable stream.
    pub enum ExtendedTcpId {
        SpectateCar = 0x00,
        ClientMessage = 0x01,
        KickBanMessage = 0x02,
    }
}

tag_enum! {
    /// Sub-tag following [`PacketId::Extended`] on the datagram channel.
    pub enum ExtendedUdpId {
        ClientMessage = 0x01,
        BatchedPositionUpdate = 0x03,
    }
}

tag_enum! {
    /// Reason byte carried by a `KickCar` packet.
    pub enum KickReason {
        VoteKicked = 0x00,
        VoteBanned = 0x01,
        VoteBlacklisted = 0x02,
        ChecksumFailed = 0x03,
        Kicked = 0x04,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve() {
        assert_eq!(PacketId::try_from(0x3D).unwrap(), PacketId::RequestNewConnection);
        assert_eq!(PacketId::try_from(0xC8).unwrap(), PacketId::LobbyCheck);
        assert_eq!(
            ExtendedUdpId::try_from(0x03).unwrap(),
            ExtendedUdpId::BatchedPositionUpdate
        );
        assert_eq!(u8::from(KickReason::ChecksumFailed), 0x03);
    }

    #[test]
    fn unknown_tag_names_its_family() {
        match ExtendedTcpId::try_from(0x7F) {
            Err(CodecError::UnknownTag { family, tag }) => {
                assert_eq!(family, "ExtendedTcpId");
                assert_eq!(tag, 0x7F);
            }
            other => panic!("expected unknown tag, got {:?}", other),
        }
    }
}
