//! tether-wire: Wire protocol and data model
//!
//! This crate defines the frames exchanged with the bridge service over the
//! duplex channel, the decoding of agent stream records into fragments, and
//! the conversation data model shared by the client and its collaborators.

pub mod error;
pub mod fragment;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use fragment::Fragment;
pub use protocol::{ClientMessage, ServerMessage};
pub use types::*;
