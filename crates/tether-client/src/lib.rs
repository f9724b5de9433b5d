//! tether-client: Client-side coordination core for agent chat
//!
//! This crate owns the single duplex channel to the bridge service and
//! coordinates everything that rides on it: request correlation, session
//! lifecycles, streamed-turn aggregation, prompt negotiation and the
//! composed conversation timeline.

pub mod aggregator;
pub mod channel;
pub mod client;
pub mod conversation;
pub mod correlator;
pub mod error;
pub mod events;
pub mod handle;
pub mod negotiation;
pub mod session;
pub mod timeline;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::{ChannelConfig, ConnectionState, ConnectionStatus, Room};
pub use client::{ChatClient, ClientConfig, ConversationSnapshot, OutgoingMessage, Turn};
pub use correlator::TurnUpdate;
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use handle::ClientHandle;
pub use timeline::TimelineItem;
pub use transport::{RetryConfig, Transport, WsTransport};
