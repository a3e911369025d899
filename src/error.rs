//! Error taxonomy for the tunnel session.
//!
//! Every operation that can fail returns a [`TunnelError`] rather than
//! unwinding; protocol violations and transport failures all funnel through
//! this enum so `on_disconnect` callbacks have one concrete type to match on.

use std::fmt;

/// A single error kind from the tunnel's failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// DNS resolution, TCP connect, or proxy CONNECT failed.
    #[error("transport connect failed: {0}")]
    TransportConnectFailed(String),

    /// TLS handshake or certificate verification failed.
    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    /// The server or proxy responded with a non-2xx status.
    #[error("HTTP rejected ({status}): {detail}")]
    HttpRejected {
        /// HTTP status code returned by the peer.
        status: u16,
        /// Free-form detail (status line, or proxy auth hint).
        detail: String,
    },

    /// Bad framing, unknown message type, or out-of-order sequence from the peer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer demanded replay older than our buffered window.
    #[error("replay window lost")]
    ReplayWindowLost,

    /// The peer-alive timer expired.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// The embedder called `cancel()`.
    #[error("client cancelled")]
    ClientCancel,

    /// The peer sent DISCONNECT with a cause.
    #[error("server disconnected: {0}")]
    ServerDisconnect(String),

    /// Ran out of channel ids or buffer budget.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Underlying I/O error not otherwise classified above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error should trigger a reconnect attempt (if a reconnect
    /// secret is available) rather than an immediate terminal close.
    ///
    /// Matches spec.md §4.3: `Ready -> Reconnecting` happens on transport
    /// failure; protocol-level and user-requested errors are always terminal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TunnelError::TransportConnectFailed(_)
                | TunnelError::TlsFailed(_)
                | TunnelError::HeartbeatTimeout
                | TunnelError::Io(_)
        )
    }
}

/// The reason string the wrapper binary prints as `TUNNEL DISCONNECT: <reason>`.
///
/// A thin wrapper so callers don't need to `Display` the whole error chain
/// when only spec.md's taxonomy name is wanted (e.g. logs vs. user-facing text).
pub fn reason_string(err: &TunnelError) -> String {
    format!("{err}")
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Graceful => write!(f, "graceful"),
            DisconnectCause::Error(err) => write!(f, "{err}"),
        }
    }
}

/// Why a session ended, passed to `on_disconnect`.
#[derive(Debug)]
pub enum DisconnectCause {
    /// Clean shutdown with no error (peer sent a bare DISCONNECT, or EOF after
    /// a graceful close handshake).
    Graceful,
    /// Terminated by an error from the taxonomy above.
    Error(TunnelError),
}

impl DisconnectCause {
    /// True if this is a `ClientCancel`-caused disconnect (used to coalesce
    /// repeated `cancel()` calls into one callback, per spec.md §5).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DisconnectCause::Error(TunnelError::ClientCancel))
    }
}
