use super::broker::{ChannelRole, ACCESS_REFUSED, CONNECTION_FORCED, NOT_ALLOWED};

/// Errors raised by the broker transport.
///
/// None of these ever reach the worker: the connection and channel managers
/// either recover from them or hand them back to whoever called `run()`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connect {
        endpoint: String,
        code: Option<u16>,
        reason: String,
    },

    #[error("broker closed the connection ({code}): {text}")]
    ConnectionClosed { code: u16, text: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{role} channel closed ({code}): {text}")]
    ChannelClosed {
        role: ChannelRole,
        code: u16,
        text: String,
    },

    #[error("giving up after {attempts} connection attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },

    #[error("{role} channel: {operation} failed: {reason}")]
    Operation {
        role: ChannelRole,
        operation: &'static str,
        reason: String,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection close codes that blind retry cannot fix: the broker forced the
/// connection closed, or the credentials/vhost were refused.
pub fn is_fatal_connection_code(code: u16) -> bool {
    matches!(code, CONNECTION_FORCED | ACCESS_REFUSED | NOT_ALLOWED)
}

impl TransportError {
    /// Protocol-fatal errors are surfaced to the caller instead of retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connect { code, .. } => code.is_some_and(is_fatal_connection_code),
            Self::ConnectionClosed { code, .. } => is_fatal_connection_code(*code),
            Self::ChannelClosed { code, .. } => *code == CONNECTION_FORCED,
            Self::AttemptsExhausted { .. } | Self::Tls(_) => true,
            Self::ConnectionLost(_) | Self::Operation { .. } | Self::Io(_) => false,
        }
    }

    /// Whether the surrounding connection is gone, so that reopening a single
    /// channel cannot help.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectionClosed { .. }
                | Self::ConnectionLost(_)
                | Self::AttemptsExhausted { .. }
                | Self::Io(_)
        )
    }

    /// Channel an error is confined to, if any.
    pub fn channel_role(&self) -> Option<ChannelRole> {
        match self {
            Self::ChannelClosed { role, .. } | Self::Operation { role, .. } => Some(*role),
            _ => None,
        }
    }
}
