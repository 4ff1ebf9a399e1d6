//! Gateway operation codes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Gateway operation codes.
///
/// Identifies the kind of payload travelling over the connection.
/// Inbound frames keep their raw `u8` so unknown future opcodes pass
/// through untouched; dispatch happens through [`OpCode::from_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event (receive only).
    Dispatch = 0,
    /// Liveness probe (bidirectional).
    Heartbeat = 1,
    /// Start a fresh session (send only).
    Identify = 2,
    /// Update the bot's presence (send only).
    PresenceUpdate = 3,
    /// Join, move or leave a voice channel (send only).
    VoiceStateUpdate = 4,
    /// Rejoin an existing session (send only).
    Resume = 6,
    /// Server asks the client to reconnect (receive only).
    Reconnect = 7,
    /// Request guild member chunks (send only).
    RequestGuildMembers = 8,
    /// Session is invalid; payload says whether resume may work
    /// (receive only).
    InvalidSession = 9,
    /// First payload after connect; carries the heartbeat interval
    /// (receive only).
    Hello = 10,
    /// Heartbeat acknowledgement (receive only).
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Raw wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Name of this op code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid op code: {value}")))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}
