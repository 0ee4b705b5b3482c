use thiserror::Error;

/// Microphone/device failures. Each kind maps to a distinct, actionable
/// user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("microphone access denied; grant microphone permission and retry")]
    PermissionDenied,

    #[error("no input device found; connect a microphone and retry")]
    NotFound,

    #[error("input device disconnected")]
    Disconnected,

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Failure to establish the streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connection rejected by server (status {status})")]
    Rejected { status: u16 },

    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

/// Failure to send an audio frame on the link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The link is not in the `Open` state. Sending fails fast here instead
    /// of buffering: buffered audio would grow without bound and arrive
    /// stale.
    #[error("link is not open (state: {state})")]
    NotOpen { state: crate::stt::LinkState },

    #[error("transport failure while sending: {0}")]
    Transport(String),
}

/// Mid-session transport failure (connection dropped, socket error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Malformed or remote-reported protocol problems on the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed inbound message: {0}")]
    Malformed(String),
}

/// Failure to obtain a session token from the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),

    #[error("token endpoint returned status {0}")]
    Status(u16),

    #[error("token endpoint returned no token")]
    Missing,
}

/// Session-level errors surfaced by [`SessionController`].
///
/// [`SessionController`]: crate::session::SessionController
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a session is already running")]
    AlreadyActive,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
