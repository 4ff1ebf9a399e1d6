//! High-level gateway commands that funnel through the send path.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::error::ShardError;
use crate::protocol::{
    StatusUpdate, build_presence_update, build_request_members, build_voice_state, intents,
};
use crate::shard::{PendingMembers, Shard};

/// Options for [`Shard::join_voice_channel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinVoiceOptions {
    /// Join muted.
    pub self_mute: bool,
    /// Join deafened; defaults to `true` when unset.
    pub self_deaf: Option<bool>,
}

/// Options for [`Shard::request_members`].
#[derive(Debug, Clone, Default)]
pub struct RequestMembersOptions {
    /// Username prefix filter. Defaults to the empty string (match
    /// everyone) unless `limit` caps the request.
    pub query: Option<String>,
    /// Maximum members to return; `0` or unset means no cap.
    pub limit: Option<u32>,
    /// Include presence data in the chunks.
    pub presences: Option<bool>,
    /// Request these specific members; forces `limit` to the ID count.
    pub user_ids: Vec<String>,
}

impl Shard {
    /// Update the bot's presence on this shard.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the shard shuts down while the
    /// frame is queued.
    pub async fn edit_shard_status(&self, status: StatusUpdate) -> Result<(), ShardError> {
        self.send(&build_presence_update(&status), false).await
    }

    /// Join (or move to) a voice channel.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the shard shuts down while the
    /// frame is queued.
    pub async fn join_voice_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
        options: JoinVoiceOptions,
    ) -> Result<(), ShardError> {
        let payload = build_voice_state(
            guild_id,
            Some(channel_id),
            options.self_mute,
            options.self_deaf.unwrap_or(true),
        );
        self.send(&payload, false).await
    }

    /// Leave the current voice channel in a guild.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the shard shuts down while the
    /// frame is queued.
    pub async fn leave_voice_channel(&self, guild_id: &str) -> Result<(), ShardError> {
        self.send(&build_voice_state(guild_id, None, false, false), false)
            .await
    }

    /// Request guild members over the gateway.
    ///
    /// With `cache_request_members` enabled the call resolves with the
    /// full member list once the final `GUILD_MEMBERS_CHUNK` arrives.
    /// With it disabled the call resolves with an empty list right
    /// after the send; the chunks are then only observable through the
    /// `message` callback.
    ///
    /// # Errors
    ///
    /// [`ShardError::MissingIntent`] when the request needs the
    /// `GUILD_MEMBERS` intent and the shard was not configured with
    /// it; [`ShardError::Shutdown`] when the shard shuts down while
    /// waiting.
    pub async fn request_members(
        &self,
        guild_id: &str,
        options: RequestMembersOptions,
    ) -> Result<Vec<serde_json::Value>, ShardError> {
        let configured = self.config().intents;
        // A broad request (no limit, or more than one member) needs the
        // privileged intent; a proxy that strips intents sends 0.
        let broad = options.limit.is_none_or(|limit| limit == 0 || limit > 1);
        if configured != 0 && broad && configured & intents::GUILD_MEMBERS == 0 {
            return Err(ShardError::MissingIntent("GUILD_MEMBERS"));
        }

        let mut options = options;
        if !options.user_ids.is_empty() {
            options.limit = Some(u32::try_from(options.user_ids.len()).unwrap_or(u32::MAX));
        }

        let nonce = format!("{guild_id}-{}", now_millis());
        let pending = if self.config().cache_request_members {
            let (tx, rx) = oneshot::channel();
            self.members().lock().await.insert(
                nonce.clone(),
                PendingMembers {
                    members: Vec::new(),
                    tx,
                },
            );
            Some(rx)
        } else {
            None
        };

        let payload = build_request_members(guild_id, &options, &nonce);
        if let Err(error) = self.send(&payload, false).await {
            self.members().lock().await.remove(&nonce);
            return Err(error);
        }

        match pending {
            Some(rx) => rx.await.map_err(|_| ShardError::Shutdown),
            None => Ok(Vec::new()),
        }
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
