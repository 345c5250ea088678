use thiserror::Error;

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Crypto,
    Protocol,
    Transport,
    Timeout,
    PermissionDenied,
    Storage,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid plaintext length: {0}")]
    InvalidLength(usize),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Unsupported encryption version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid MAC")]
    InvalidMac,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connect rejected by signer: {0}")]
    ConnectRejected(String),

    #[error("Invalid bunker URL: {0}")]
    InvalidBunkerUrl(String),

    #[error("No relay reachable")]
    NoRelayReachable,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Signer error: {0}")]
    Remote(String),

    #[error("Session disconnected")]
    Disconnected,

    #[error("Not connected to a remote signer")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nostr(#[from] nostr::event::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Base64(_)
            | Error::TooShort(_)
            | Error::InvalidLength(_)
            | Error::InvalidPadding
            | Error::Json(_)
            | Error::Hex(_) => ErrorKind::Decode,
            Error::UnsupportedVersion(_) | Error::InvalidMac | Error::InvalidKey => {
                ErrorKind::Crypto
            }
            Error::Protocol(_)
            | Error::ConnectRejected(_)
            | Error::InvalidBunkerUrl(_)
            | Error::Remote(_)
            | Error::NostrKey(_)
            | Error::Nostr(_) => ErrorKind::Protocol,
            Error::NoRelayReachable
            | Error::Transport(_)
            | Error::Disconnected
            | Error::NotConnected => ErrorKind::Transport,
            Error::Timeout => ErrorKind::Timeout,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
