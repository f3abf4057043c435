use std::error::Error;
use std::fmt;
use std::fmt::Display;

use web_time::Duration;

use crate::network::codec::CodecError;
use crate::network::compression::CompressionError;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Errors raised while servicing one connection hang up that connection only; they reach
/// the host through the [`NotificationSink`](crate::NotificationSink) rather than as a
/// return value. Errors returned from session methods are about the session as a whole or
/// about misuse of the API.
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayError {
    /// The peer sent something the protocol does not allow at this point. The connection is
    /// answered with NAK and hung up.
    ProtocolViolation {
        /// What was wrong with the message.
        reason: String,
    },
    /// The peer's password hash matched neither the play nor the spectate password.
    AuthenticationFailure,
    /// The peer speaks a protocol version older than we accept.
    VersionIncompatible {
        /// Our protocol version.
        local: u32,
        /// The version announced by the peer.
        remote: u32,
    },
    /// The peer is running on an incompatible platform, or with a different core.
    IncompatiblePeer {
        /// Which check failed.
        reason: String,
    },
    /// A stalled peer made no progress within the allowed time.
    StallTimeout {
        /// How long the stall lasted.
        elapsed: Duration,
    },
    /// The core cannot produce savestates, so savestate-based resync is disabled.
    SerializationUnavailable,
    /// A socket operation failed, including an orderly close by the peer.
    Socket {
        /// A description of the socket error.
        context: String,
    },
    /// A savestate could not be compressed or decompressed.
    Compression(CompressionError),
    /// A payload could not be encoded or decoded.
    Codec(CodecError),
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
}

impl NetplayError {
    /// Shorthand for [`NetplayError::ProtocolViolation`].
    pub fn violation(reason: impl Into<String>) -> Self {
        NetplayError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`NetplayError::Socket`].
    pub fn socket(context: impl Into<String>) -> Self {
        NetplayError::Socket {
            context: context.into(),
        }
    }

    /// Whether the peer should be told with a NAK before the hangup.
    #[must_use]
    pub fn warrants_nak(&self) -> bool {
        matches!(
            self,
            NetplayError::ProtocolViolation { .. } | NetplayError::Codec(_)
        )
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::ProtocolViolation { reason } => {
                write!(f, "Protocol violation: {}", reason)
            }
            NetplayError::AuthenticationFailure => {
                write!(f, "Authentication failed: password hash did not match")
            }
            NetplayError::VersionIncompatible { local, remote } => {
                write!(
                    f,
                    "Peer protocol version {} is incompatible with ours ({})",
                    remote, local
                )
            }
            NetplayError::IncompatiblePeer { reason } => {
                write!(f, "Incompatible peer: {}", reason)
            }
            NetplayError::StallTimeout { elapsed } => {
                write!(f, "Peer stalled for {:?} without progress", elapsed)
            }
            NetplayError::SerializationUnavailable => {
                write!(
                    f,
                    "The core cannot serialize its state; running without savestates"
                )
            }
            NetplayError::Socket { context } => {
                write!(f, "Socket error: {}", context)
            }
            NetplayError::Compression(err) => {
                write!(f, "Compression error: {}", err)
            }
            NetplayError::Codec(err) => {
                write!(f, "Codec error: {}", err)
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetplayError::Compression(err) => Some(err),
            NetplayError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::Codec(err)
    }
}

impl From<CompressionError> for NetplayError {
    fn from(err: CompressionError) -> Self {
        NetplayError::Compression(err)
    }
}

impl From<std::io::Error> for NetplayError {
    fn from(err: std::io::Error) -> Self {
        NetplayError::Socket {
            context: err.to_string(),
        }
    }
}
