//! Error types for Argus.
//!
//! Error kinds are only as granular as their handling requires; specifics
//! are logged at the location the error happens.

use thiserror::Error;

/// Result type alias using Argus's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Argus operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Source or codec setup failed; terminates the pipeline.
    #[error("stream initialization failed: {0}")]
    StreamInitialization(String),

    /// Decode or scale failure for a single frame.
    #[error("frame generation failed: {0}")]
    FrameGeneration(String),

    /// Underlying I/O reactor error.
    #[error("reactor error: {0}")]
    Reactor(String),

    /// Source exhausted. Normal for file sources; mapped to `complete`.
    #[error("end of stream")]
    EndOfStream,

    /// Decoder consumed input but produced no picture yet. Recoverable:
    /// the decode operator swallows it and pulls the next packet.
    #[error("frame not ready")]
    FrameNotReady,

    /// Bus client is not connected.
    #[error("bus client is not connected")]
    NotConnected,

    /// Failed to parse a bus response.
    #[error("error parsing bus response: {0}")]
    ResponseParsing(String),

    /// Bus response was well-formed but unexpected.
    #[error("invalid bus response: {0}")]
    InvalidResponse(String),

    /// The bus rejected a subscribe request.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The bus rejected an unsubscribe request.
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    /// An established subscription failed.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is recoverable at frame granularity.
    ///
    /// Recoverable errors increment a counter and the pipeline continues;
    /// everything else is stream-fatal.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Error::FrameNotReady | Error::FrameGeneration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind() {
        let err = Error::StreamInitialization("no such codec".into());
        assert_eq!(
            err.to_string(),
            "stream initialization failed: no such codec"
        );
    }

    #[test]
    fn test_frame_local_classification() {
        assert!(Error::FrameNotReady.is_frame_local());
        assert!(Error::FrameGeneration("bad packet".into()).is_frame_local());
        assert!(!Error::EndOfStream.is_frame_local());
        assert!(!Error::NotConnected.is_frame_local());
    }
}
