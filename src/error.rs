//! Crate-level error type.
//!
//! Every boundary of the relay pipeline (validation, moderation, dispatch,
//! encoding) returns [`Result`], so failures travel as values and the server
//! turns them into a single JSON error response before any streaming starts.

use thiserror::Error;

/// Message shown when a turn ends without the stream sentinel.
pub const ABORTED_MESSAGE: &str = "Sorry, something went wrong while generating the response.";

#[derive(Debug, Error)]
pub enum RelayError {
    /// Body is not JSON, a role is outside `system|user|assistant`, or a
    /// required field is missing.
    #[error("Invalid request payload")]
    InvalidPayload,

    /// The challenge token was present but empty.
    #[error("Missing verification token")]
    MissingToken,

    /// The anti-abuse service rejected the token, answered with an
    /// unexpected shape, or could not be reached.
    #[error("Verification failed")]
    VerificationFailed,

    /// The moderation classifier judged the latest user message unsafe.
    #[error("Your message violates our content policy. Please try again with different content.")]
    ContentPolicyViolation,

    /// The upstream provider call failed, before or during streaming.
    #[error("{0}")]
    DispatchFailure(String),

    /// A wire frame could not be parsed. Recovered locally by the decoder.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The byte stream ended without the sentinel frame.
    #[error("{}", ABORTED_MESSAGE)]
    StreamAborted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status used when this error is returned as a JSON body.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::InvalidPayload
            | RelayError::MissingToken
            | RelayError::VerificationFailed
            | RelayError::ContentPolicyViolation
            | RelayError::MalformedFrame(_) => 400,
            RelayError::DispatchFailure(_)
            | RelayError::StreamAborted
            | RelayError::Config(_)
            | RelayError::Io(_) => 500,
        }
    }

    /// Build a `DispatchFailure`, substituting a generic message for an
    /// empty description.
    pub fn dispatch(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if detail.trim().is_empty() {
            RelayError::DispatchFailure("Unexpected error".to_string())
        } else {
            RelayError::DispatchFailure(detail)
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
