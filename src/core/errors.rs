// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete frame in stream")]
    IncompleteFrame,

    #[error("Frame payload of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Bad handshake: {0}")]
    BadHandshake(String),

    #[error("Wrong server password")]
    WrongPassword,

    #[error("Server is full")]
    ServerFull,

    #[error("You are banned from this server")]
    Banned,

    #[error("You are not authorized")]
    NotAuthorized,

    #[error("Unknown uid {0}")]
    UnknownUid(u32),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// `std::io::Error` is not cloneable; wrapping it in an Arc allows the error
// to be cheaply shared between the worker that observed it and the
// sequencer that reports it.
impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Io(Arc::clone(e)),
            RelayError::IncompleteFrame => RelayError::IncompleteFrame,
            RelayError::FrameTooLarge(n) => RelayError::FrameTooLarge(*n),
            RelayError::MalformedPayload(s) => RelayError::MalformedPayload(s.clone()),
            RelayError::BadHandshake(s) => RelayError::BadHandshake(s.clone()),
            RelayError::WrongPassword => RelayError::WrongPassword,
            RelayError::ServerFull => RelayError::ServerFull,
            RelayError::Banned => RelayError::Banned,
            RelayError::NotAuthorized => RelayError::NotAuthorized,
            RelayError::UnknownUid(u) => RelayError::UnknownUid(*u),
            RelayError::Script(s) => RelayError::Script(s.clone()),
            RelayError::Registry(s) => RelayError::Registry(s.clone()),
            RelayError::Internal(s) => RelayError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Registry(e.to_string())
    }
}

impl From<mlua::Error> for RelayError {
    fn from(e: mlua::Error) -> Self {
        RelayError::Script(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for RelayError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        RelayError::MalformedPayload(e.to_string())
    }
}
