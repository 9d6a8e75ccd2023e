use crate::message::PeerId;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Message references an unknown peer, arrived in the wrong state or carries a malformed
    /// payload. Always logged and dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A media connection rejected an offer, answer or description.
    #[error("negotiation failed: {0}")]
    Negotiation(Arc<webrtc::Error>),
    /// A connectivity candidate could not be applied.
    #[error("candidate rejected: {0}")]
    Candidate(Arc<webrtc::Error>),
    /// Local media could not be acquired.
    #[error("media capture failed: {0}")]
    Capture(String),
    /// Connection to the relay bus was lost.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Codec(Arc<serde_json::Error>),
    /// Session has been destroyed while the operation was in flight.
    #[error("session with {0} is closed")]
    Closed(PeerId),
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn candidate(e: webrtc::Error) -> Self {
        Error::Candidate(Arc::new(e))
    }

    /// Returns true for errors which are logged and dropped rather than surfaced.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Codec(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Negotiation(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(Arc::new(value))
    }
}
