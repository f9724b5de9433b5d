//! Transport abstraction for the duplex channel

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_wire::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::error::TransportError;

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive reconnect attempts before giving up
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// One live connection: frames to send in, decoded frames out.
///
/// Dropping `outbound` closes the connection. `inbound` yields `None` once
/// the connection is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens physical connections to the bridge service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one connection. Called once per (re)connect attempt.
    async fn open(&self) -> Result<Link, TransportError>;
}

/// WebSocket transport speaking JSON text frames
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// Create a transport for a `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Link, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode '{}' frame: {}", message.event(), e);
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    tracing::debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(tungstenite::Message::Text(text)) => match ServerMessage::decode(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_custom_multiplier() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 3.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_ws_transport_refused_connection() {
        // Port 9 (discard) is essentially never listening for WebSockets locally
        let transport = WsTransport::new("ws://127.0.0.1:9/socket");
        let result = transport.open().await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
