use thiserror::Error;

/// Errors that can occur in the windowed block transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("out of memory")]
    NoMemory,
    #[error("invalid parameters")]
    InvalidParams,
    #[error("invalid frame")]
    InvalidFrame,
    #[error("invalid control message")]
    InvalidControl,
    #[error("network send failed")]
    NetworkError,
    #[error("session not found")]
    SessionNotFound,
    #[error("session in progress")]
    SessionInProgress,
    #[error("session table full")]
    MaxSessionsReached,
    #[error("timed out")]
    TimedOut,
    #[error("session expired")]
    Expired,
    #[error("internal error")]
    Internal,
}

impl TransportError {
    /// Stable on-wire value, carried in ACK frames and ABORT/ACK control
    /// messages. Zero is reserved for "no error".
    pub fn wire_code(self) -> u8 {
        match self {
            TransportError::NoMemory => 1,
            TransportError::InvalidParams => 2,
            TransportError::InvalidFrame => 3,
            TransportError::InvalidControl => 4,
            TransportError::NetworkError => 5,
            TransportError::SessionNotFound => 6,
            TransportError::SessionInProgress => 7,
            TransportError::MaxSessionsReached => 8,
            TransportError::TimedOut => 9,
            TransportError::Expired => 10,
            TransportError::Internal => 11,
        }
    }

    /// Maps a peer-reported wire code back to an error. Unknown codes (and the
    /// reserved zero) decode as `Internal` rather than being rejected.
    pub fn from_wire(code: u8) -> TransportError {
        match code {
            1 => TransportError::NoMemory,
            2 => TransportError::InvalidParams,
            3 => TransportError::InvalidFrame,
            4 => TransportError::InvalidControl,
            5 => TransportError::NetworkError,
            6 => TransportError::SessionNotFound,
            7 => TransportError::SessionInProgress,
            8 => TransportError::MaxSessionsReached,
            9 => TransportError::TimedOut,
            10 => TransportError::Expired,
            _ => TransportError::Internal,
        }
    }
}
