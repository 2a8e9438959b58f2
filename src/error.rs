// Error taxonomy for the gateway.
//
// Every failure that reaches the dispatcher is one of these variants, and each
// variant knows how to render itself as the (short, detail) pair carried by an
// Error frame.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Oversized or empty frame, unexpected message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame whose fields do not fit the layout implied by its tag.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Misconfiguration for the requested operation. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("crypter is not configured")]
    CrypterNotConfigured,

    /// Storage, crypter or metadata-source failure.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error("exhausted {attempts} retries reading {path} at offset {offset}")]
    ExhaustedRetries {
        path: String,
        offset: u64,
        attempts: usize,
    },

    /// Some objects in a batch still failed after the retry rounds.
    #[error("{} object(s) failed after retries", failed.len())]
    PartialFailure { failed: Vec<String> },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Short status string placed in the first field of an Error frame.
    pub fn short_message(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol error",
            Self::MalformedMessage(_) => "malformed message",
            Self::Configuration(_) | Self::CrypterNotConfigured => "configuration error",
            Self::Collaborator(_) => "backend error",
            Self::ExhaustedRetries { .. } => "retries exhausted",
            Self::PartialFailure { .. } => "partial failure",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "i/o error",
        }
    }

    /// Free-text detail for the Error frame. Partial failures enumerate the
    /// residual set so the client can tell them apart from total failure.
    pub fn detail(&self) -> String {
        match self {
            Self::Protocol(msg) | Self::MalformedMessage(msg) | Self::Configuration(msg) => {
                msg.clone()
            }
            Self::CrypterNotConfigured => "crypter is not configured".to_string(),
            Self::Collaborator(err) => format!("{err:#}"),
            Self::ExhaustedRetries {
                path,
                offset,
                attempts,
            } => format!("{path} at offset {offset} after {attempts} attempts"),
            Self::PartialFailure { failed } => format!("failed: {}", failed.join(", ")),
            Self::Cancelled => "gateway is shutting down".to_string(),
            Self::Io(err) => err.to_string(),
        }
    }

    /// `(short-message, detail)` pair carried by an Error frame.
    pub fn error_frame(&self) -> (&'static str, String) {
        (self.short_message(), self.detail())
    }

    /// Whether the connection can no longer be trusted to carry frames.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::MalformedMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
