use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatPgpError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("key not found: {0}")]
    Resolution(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl ChatPgpError {
    pub fn not_implemented(msg: &'static str) -> Self {
        ChatPgpError::NotImplemented(msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        ChatPgpError::Parse(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        ChatPgpError::BackendUnavailable(msg.into())
    }
}

impl From<std::io::Error> for ChatPgpError {
    fn from(err: std::io::Error) -> Self {
        ChatPgpError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChatPgpError {
    fn from(err: serde_json::Error) -> Self {
        ChatPgpError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatPgpError>;
