//! Error types for tether-wire

use thiserror::Error;

/// Result type alias using tether-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or encoding frames
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not a `{event, data}` envelope
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A known event carried a payload that does not match its schema
    #[error("Invalid payload for '{event}': {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an invalid-payload error for an event
    pub fn invalid_payload(event: impl Into<String>, source: serde_json::Error) -> Self {
        Self::InvalidPayload {
            event: event.into(),
            source,
        }
    }

    /// The event name this error relates to, if any
    pub fn event(&self) -> Option<&str> {
        match self {
            Error::InvalidPayload { event, .. } => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_payload_reports_event() {
        let source = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let e = Error::invalid_payload("chat:error", source);
        assert_eq!(e.event(), Some("chat:error"));
        assert!(e.to_string().contains("chat:error"));
    }

    #[test]
    fn test_malformed_frame_has_no_event() {
        let e = Error::MalformedFrame("missing event".into());
        assert_eq!(e.event(), None);
        assert_eq!(e.to_string(), "Malformed frame: missing event");
    }
}
