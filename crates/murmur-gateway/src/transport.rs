//! Transport abstraction over the `WebSocket` connection.
//!
//! The shard consumes the socket as an abstract duplex stream so tests
//! can substitute an in-process mock for the production
//! `tokio-tungstenite` implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::ShardError;

/// Capacity of the inbound event channel per connection.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Signals delivered by a transport connection, in receive order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame.
    Text(String),
    /// A binary frame (compressed payload).
    Binary(Vec<u8>),
    /// The peer closed the connection.
    Closed {
        /// Close code from the close frame, `1000` if absent.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// Transport-level error; the stream ends after this.
    Error(String),
}

/// Write half of an open connection.
#[async_trait]
pub trait TransportSink: Send {
    /// Send a text frame.
    async fn send(&mut self, text: String) -> Result<(), ShardError>;

    /// Send a close frame with the given code.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ShardError>;
}

/// An established duplex connection.
pub struct TransportConnection {
    /// Write half.
    pub sink: Box<dyn TransportSink>,
    /// Ordered inbound events; the channel closes when the connection
    /// dies.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for duplex gateway connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`; resolves once the socket is open.
    async fn connect(&self, url: &str) -> Result<TransportConnection, ShardError>;
}

// ── tokio-tungstenite implementation ─────────────────────────

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    writer: futures::stream::SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), ShardError> {
        self.writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ShardError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        self.writer.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<TransportConnection, ShardError> {
        let (ws, _response) = connect_async(url).await?;
        let (writer, mut reader) = ws.split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => TransportEvent::Binary(bytes.to_vec()),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        let _ = tx.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    // Ping/pong answered by tungstenite itself.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(error) => {
                        debug!(%error, "websocket read error");
                        let _ = tx.send(TransportEvent::Error(error.to_string())).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(TransportConnection {
            sink: Box::new(WsSink { writer }),
            events: rx,
        })
    }
}
