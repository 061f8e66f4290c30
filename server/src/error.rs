//! Error kinds shared by the server modules.
//!
//! `GameError` separates input problems, which are reported back to the
//! client with detail, from invariant violations, which are logged in full
//! and surfaced to the client only as an opaque `server-error`.

use shared::{OutgoingMessage, ValidationInfo};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decode record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("bad payload: {info}")]
    BadPayload { info: String, reasons: Vec<String> },

    #[error("bad attack: {0}")]
    BadAttack(String),

    #[error("\"{0}\" is an unrecognised message type")]
    BadMessageType(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GameError {
    pub fn bad_payload(info: impl Into<String>) -> Self {
        GameError::BadPayload {
            info: info.into(),
            reasons: Vec::new(),
        }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        GameError::Invariant(detail.into())
    }

    /// True for errors the client caused and can correct
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            GameError::BadPayload { .. } | GameError::BadAttack(_) | GameError::BadMessageType(_)
        )
    }

    pub fn to_message(&self) -> OutgoingMessage {
        match self {
            GameError::BadPayload { info, reasons } => OutgoingMessage::BadPayload(ValidationInfo {
                info: info.clone(),
                reasons: reasons.clone(),
            }),
            GameError::BadAttack(info) => OutgoingMessage::BadAttack(ValidationInfo::new(info.clone())),
            GameError::BadMessageType(_) => {
                OutgoingMessage::BadMessageType(ValidationInfo::new(self.to_string()))
            }
            GameError::Invariant(_) | GameError::Store(_) => {
                OutgoingMessage::ServerError(ValidationInfo::default())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
