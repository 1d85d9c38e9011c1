//! Error types shared across the crate.

use thiserror::Error;

use crate::types::ReplyStatus;

/// A compare-and-swap precondition did not hold. The node is left untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CasError {
    #[error("status mismatch: expected {expected}, found {actual}")]
    StatusMismatch { expected: i32, actual: i32 },

    #[error("owner mismatch: node is owned by {current:?}, caller is {caller:?}")]
    OwnerMismatch {
        current: Option<String>,
        caller: Option<String>,
    },
}

impl CasError {
    pub fn reply_status(&self) -> ReplyStatus {
        match self {
            CasError::StatusMismatch { .. } => ReplyStatus::StatusCas,
            CasError::OwnerMismatch { .. } => ReplyStatus::OwnerCas,
        }
    }
}

/// The node is electing or not running and cannot serve requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("service unavailable: {0}")]
pub struct Unavailable(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("no quorum: {acks} acknowledgments, {required} required")]
    NoQuorum { acks: usize, required: usize },

    #[error(transparent)]
    Unavailable(#[from] Unavailable),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("hash tree is a read-only mirror")]
    ReadOnly,

    #[error("hash depth {depth} is invalid for range [{left}, {right})")]
    InvalidDepth { depth: u8, left: i64, right: i64 },
}

/// Wire decode failure. Not recoverable in place; the transport owns the
/// connection and decides what to do with it.
#[derive(Error, Debug)]
pub enum MalformedMessage {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown verb code {0}")]
    UnknownVerb(u32),

    #[error("invalid session id: {0}")]
    SessionId(#[from] std::string::FromUtf8Error),

    #[error("unknown reply status {0}")]
    UnknownStatus(i32),

    #[error("failed to decode body: {0}")]
    Body(#[from] bincode::error::DecodeError),

    #[error("failed to encode body: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("unexpected {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("session id of {0} bytes does not fit the frame")]
    SessionTooLong(usize),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
