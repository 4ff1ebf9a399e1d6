//! Shard connection configuration.

use std::time::Duration;

use serde::Serialize;

/// Primary gateway endpoint.
///
/// Version and encoding query parameters are appended only when the
/// configured endpoint is this host; proxy gateways receive the URL
/// unmodified.
pub const PRIMARY_GATEWAY: &str = "wss://gateway.discord.gg";

/// Connection configuration for a [`Shard`](crate::Shard).
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Bot token, without the `Bot ` prefix.
    pub token: String,
    /// Gateway intents bitfield.
    pub intents: u64,
    /// Gateway endpoint URL.
    pub url: String,
    /// Gateway API version.
    pub version: u8,
    /// Ask the gateway for compressed payloads.
    ///
    /// Requires an inflater hook; binary frames are dropped otherwise.
    pub compress: bool,
    /// Total shard count, sent as `shard: [id, total]` in the identify
    /// payload.
    pub total_shards: u32,
    /// Identify connection properties.
    pub properties: IdentifyProperties,
    /// Gateway command budget per rate-limit interval.
    pub max_requests_per_interval: u32,
    /// Rate-limit refill interval.
    pub rate_limit_refill_interval: Duration,
    /// Accumulate `GUILD_MEMBERS_CHUNK` responses so that
    /// [`request_members`](crate::Shard::request_members) resolves with
    /// the full member list.
    pub cache_request_members: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            url: PRIMARY_GATEWAY.to_string(),
            version: 10,
            compress: false,
            total_shards: 1,
            properties: IdentifyProperties::default(),
            max_requests_per_interval: 120,
            rate_limit_refill_interval: Duration::from_secs(60),
            cache_request_members: false,
        }
    }
}

/// `properties` block of the identify payload.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    /// Operating system name.
    pub os: String,
    /// Library name reported as the browser.
    pub browser: String,
    /// Library name reported as the device.
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "murmur".to_string(),
            device: "murmur".to_string(),
        }
    }
}
