//! Wire payloads and the builders for every frame this client sends.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::opcode::OpCode;
use crate::commands::RequestMembersOptions;
use crate::config::ShardConfig;

/// Gateway intent bits used by this crate.
pub mod intents {
    /// `GUILDS`
    pub const GUILDS: u64 = 1 << 0;
    /// `GUILD_MEMBERS` — privileged; required for broad member requests.
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    /// `GUILD_MESSAGES`
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    /// `DIRECT_MESSAGES`
    pub const DIRECT_MESSAGES: u64 = 1 << 12;
    /// `MESSAGE_CONTENT` — privileged.
    pub const MESSAGE_CONTENT: u64 = 1 << 15;
}

/// Raw gateway frame as sent and received.
///
/// `op` stays a raw `u8` so frames with opcodes newer than this crate
/// still parse; dispatch goes through [`OpCode::from_u8`]. The `s` and
/// `t` fields are only set on `op = 0` dispatch frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPacket {
    /// Opcode of the frame.
    pub op: u8,
    /// Opcode-dependent data.
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    /// Sequence number.
    #[serde(default)]
    pub s: Option<u64>,
    /// Dispatch event name.
    #[serde(default)]
    pub t: Option<String>,
}

/// `Hello` payload data (`op = 10`).
#[derive(Debug, Deserialize)]
pub struct Hello {
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
}

/// `READY` dispatch data, reduced to the fields the shard keeps.
#[derive(Debug, Deserialize)]
pub struct Ready {
    /// Session ID required to resume.
    pub session_id: String,
    /// Endpoint to reconnect to while resuming.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// `GUILD_MEMBERS_CHUNK` dispatch data.
#[derive(Debug, Deserialize)]
pub struct GuildMembersChunk {
    /// Correlation nonce echoed from the request.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Member objects in this chunk, passed through verbatim.
    #[serde(default)]
    pub members: Vec<serde_json::Value>,
    /// Index of this chunk.
    #[serde(default)]
    pub chunk_index: u32,
    /// Total number of chunks for the request.
    #[serde(default)]
    pub chunk_count: u32,
}

/// Presence payload produced by the embedding application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Activity objects, passed through verbatim.
    #[serde(default)]
    pub activities: Vec<serde_json::Value>,
    /// Status string (`online`, `idle`, `dnd`, `invisible`, `offline`).
    #[serde(default)]
    pub status: String,
}

/// Build a heartbeat frame (`op = 1`) carrying the last seen sequence.
#[must_use]
pub fn build_heartbeat(sequence: Option<u64>) -> GatewayPacket {
    GatewayPacket {
        op: OpCode::Heartbeat.as_u8(),
        d: Some(sequence.map_or(serde_json::Value::Null, serde_json::Value::from)),
        s: None,
        t: None,
    }
}

/// Build an identify frame (`op = 2`).
///
/// `presence` is included only when the presence factory yielded one.
#[must_use]
pub fn build_identify(
    config: &ShardConfig,
    shard_id: u32,
    presence: Option<StatusUpdate>,
) -> GatewayPacket {
    let mut d = json!({
        "token": format!("Bot {}", config.token),
        "compress": config.compress,
        "properties": config.properties,
        "intents": config.intents,
        "shard": [shard_id, config.total_shards],
    });
    if let Some(presence) = presence
        && let Ok(value) = serde_json::to_value(&presence)
    {
        d["presence"] = value;
    }
    GatewayPacket {
        op: OpCode::Identify.as_u8(),
        d: Some(d),
        s: None,
        t: None,
    }
}

/// Build a resume frame (`op = 6`).
#[must_use]
pub fn build_resume(token: &str, session_id: &str, sequence: u64) -> GatewayPacket {
    GatewayPacket {
        op: OpCode::Resume.as_u8(),
        d: Some(json!({
            "token": format!("Bot {token}"),
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

/// Build a presence update frame (`op = 3`).
#[must_use]
pub fn build_presence_update(status: &StatusUpdate) -> GatewayPacket {
    GatewayPacket {
        op: OpCode::PresenceUpdate.as_u8(),
        d: Some(json!({
            "since": null,
            "afk": false,
            "activities": status.activities,
            "status": status.status,
        })),
        s: None,
        t: None,
    }
}

/// Build a voice state update frame (`op = 4`).
///
/// `channel_id = None` leaves the current voice channel.
#[must_use]
pub fn build_voice_state(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> GatewayPacket {
    GatewayPacket {
        op: OpCode::VoiceStateUpdate.as_u8(),
        d: Some(json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        })),
        s: None,
        t: None,
    }
}

/// Build a request-guild-members frame (`op = 8`).
///
/// `query` defaults to the empty string (match everyone) unless a
/// limit caps the request, in which case it is omitted.
#[must_use]
pub fn build_request_members(
    guild_id: &str,
    options: &RequestMembersOptions,
    nonce: &str,
) -> GatewayPacket {
    let mut d = json!({
        "guild_id": guild_id,
        "limit": options.limit.unwrap_or(0),
        "presences": options.presences.unwrap_or(false),
        "nonce": nonce,
    });
    match (&options.query, options.limit) {
        (Some(query), _) => d["query"] = json!(query),
        (None, None | Some(0)) => d["query"] = json!(""),
        (None, Some(_)) => {}
    }
    if !options.user_ids.is_empty() {
        d["user_ids"] = json!(options.user_ids);
    }
    GatewayPacket {
        op: OpCode::RequestGuildMembers.as_u8(),
        d: Some(d),
        s: None,
        t: None,
    }
}
