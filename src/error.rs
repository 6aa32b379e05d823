//! ryuldn_bridge/src/error.rs
//! Crate-wide error taxonomy. Internal code returns `Result<_, LdnError>` and
//! propagates with `?`; the FFI boundary (see `ffi.rs`) translates these into
//! plain `i32` codes so no Rust error type crosses the C ABI.

use std::fmt;

/// Typed protocol-level failures, matching the reference relay's `NetworkError` enum.
/// Surfaced once to the pending request that triggered them, then consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    PortUnreachable,
    TooManyPlayers,
    VersionTooLow,
    VersionTooHigh,
    ConnectFailure,
    ConnectNotFound,
    ConnectTimeout,
    ConnectRejected,
    RejectFailed,
    BannedByServer,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkError::PortUnreachable => "port unreachable",
            NetworkError::TooManyPlayers => "too many players",
            NetworkError::VersionTooLow => "version too low",
            NetworkError::VersionTooHigh => "version too high",
            NetworkError::ConnectFailure => "connect failure",
            NetworkError::ConnectNotFound => "network not found",
            NetworkError::ConnectTimeout => "connect timeout",
            NetworkError::ConnectRejected => "connect rejected",
            NetworkError::RejectFailed => "reject failed",
            NetworkError::BannedByServer => "banned by server",
        };
        f.write_str(s)
    }
}

impl NetworkError {
    /// Decode from the wire's `NetworkErrorMessage.error` byte. Unknown codes
    /// are folded into `ConnectFailure` rather than panicking on unrecognized
    /// servers.
    pub fn from_wire(code: u8) -> Self {
        match code {
            1 => NetworkError::PortUnreachable,
            2 => NetworkError::TooManyPlayers,
            3 => NetworkError::VersionTooLow,
            4 => NetworkError::VersionTooHigh,
            5 => NetworkError::ConnectFailure,
            6 => NetworkError::ConnectNotFound,
            7 => NetworkError::ConnectTimeout,
            8 => NetworkError::ConnectRejected,
            9 => NetworkError::RejectFailed,
            10 => NetworkError::BannedByServer,
            _ => NetworkError::ConnectFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LdnError {
    #[error("framing error: {0}")]
    Framing(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(NetworkError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("peer-relay authentication failed")]
    Auth,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("socket not connected")]
    NotConnected,

    #[error("socket write half shut down")]
    WriteShutdown,

    #[error("socket not bound")]
    NotBound,

    #[error("destination unreachable")]
    Unreachable,
}

pub type Result<T> = std::result::Result<T, LdnError>;

/// Stable FFI result codes, mirroring the reference codebase's convention of
/// threading plain integers across the C boundary instead of a Rust error type.
pub type FfiCode = i32;
pub const OK: FfiCode = 0;
pub const ERR_INTERNAL: FfiCode = -1;
pub const ERR_BAD_PARAM: FfiCode = -2;
pub const ERR_NOT_FOUND: FfiCode = -3;
pub const ERR_TIMEOUT: FfiCode = -4;
pub const ERR_NOT_CONNECTED: FfiCode = -5;

impl From<&LdnError> for FfiCode {
    fn from(e: &LdnError) -> FfiCode {
        match e {
            LdnError::Timeout(_) => ERR_TIMEOUT,
            LdnError::NotConnected | LdnError::NotBound => ERR_NOT_CONNECTED,
            LdnError::InvalidConfig(_) => ERR_BAD_PARAM,
            _ => ERR_INTERNAL,
        }
    }
}
