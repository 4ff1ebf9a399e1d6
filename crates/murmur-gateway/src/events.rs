//! Shard lifecycle callbacks.

use crate::protocol::GatewayPacket;

/// Named lifecycle callbacks invoked by a [`Shard`](crate::Shard).
///
/// Every method has a no-op default; implement the ones you care
/// about. Callbacks run on the shard's reader and timer tasks and must
/// not block.
#[allow(unused_variables)]
pub trait ShardEvents: Send + Sync {
    /// The shard is opening a socket.
    fn connecting(&self, shard_id: u32) {}

    /// The socket is open.
    fn connected(&self, shard_id: u32) {}

    /// An identify attempt started.
    fn identifying(&self, shard_id: u32) {}

    /// An identify attempt produced a `READY`.
    fn identified(&self, shard_id: u32) {}

    /// The connection closed with the given code.
    fn disconnected(&self, shard_id: u32, code: u16) {}

    /// The server sent `Hello` with its heartbeat interval.
    fn hello(&self, shard_id: u32, heartbeat_interval_ms: u64) {}

    /// A heartbeat was transmitted carrying this sequence number.
    fn heartbeat(&self, shard_id: u32, sequence: Option<u64>) {}

    /// The server acknowledged a heartbeat.
    fn heartbeat_ack(&self, shard_id: u32, rtt_ms: Option<u64>) {}

    /// The server asked the shard to reconnect.
    fn requested_reconnect(&self, shard_id: u32) {}

    /// The session was invalidated; `resumable` says whether a resume
    /// may still work.
    fn invalid_session(&self, shard_id: u32, resumable: bool) {}

    /// A resume completed.
    fn resumed(&self, shard_id: u32) {}

    /// Any gateway packet, after the configured naming transform.
    fn message(&self, shard_id: u32, packet: &GatewayPacket) {}
}

/// Event sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ShardEvents for NoopEvents {}
