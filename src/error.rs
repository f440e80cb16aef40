//! Error taxonomy shared by the engine and the RPC layer.
//!
//! [`LvmdError`] is serializable so a failure crosses the socket unchanged and
//! the client sees the same variant the service produced.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum LvmdError {
    /// Invalid device-class or option-class configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The capacity check failed; nothing was allocated.
    #[error("not enough space: {0}")]
    ResourceExhausted(String),

    /// The executor failed. Carries its diagnostic output.
    #[error("internal error: {0}")]
    Internal(String),

    /// Socket or framing failure observed by a client.
    #[error("transport error: {0}")]
    Transport(String),
}

impl LvmdError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Internal(_) => "internal",
            Self::Transport(_) => "transport",
        }
    }

    /// Wraps an executor failure, keeping the whole context chain.
    pub fn internal(e: anyhow::Error) -> Self {
        Self::Internal(format!("{e:#}"))
    }

    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LvmdError>;
