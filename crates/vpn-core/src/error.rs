use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Packet-level classification failure, returned by [`crate::packet::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("buffer shorter than a minimal IPv4 header")]
    TooShort,
    #[error("version nibble is not 4")]
    NotIPv4,
    #[error("declared total length exceeds buffer")]
    Malformed,
}

/// Why a tunnel failed to come up. Retryable kinds trigger a backoff
/// reconnect from `reconnecting`; fatal kinds close the slot.
#[derive(Debug, Clone, Error)]
pub enum TunnelStartupError {
    #[error("connect timed out")]
    Timeout,
    #[error("transport refused the connection")]
    TransportRefused,
    #[error("peer rejected authentication")]
    AuthRejected,
    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),
    #[error("handshake failed transiently: {0}")]
    HandshakeTransient(String),
    #[error("negotiated protocol does not match the configured client")]
    ProtocolMismatch,
}

impl TunnelStartupError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelStartupError::Timeout
                | TunnelStartupError::TransportRefused
                | TunnelStartupError::HandshakeTransient(_)
        )
    }
}

/// Unified error type for the core router library.
///
/// Hot-path errors (`Parse`, no-owner, no-route) are handled locally by
/// the router and never propagate past it as a `CoreError`; this enum
/// exists for the operations that genuinely need to fail loudly —
/// tunnel bring-up, the legacy bridge, and the engine's own lifecycle.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("packet parse failure: {0}")]
    Parse(#[from] ParseError),

    #[error("tunnel startup failed: {0}")]
    TunnelStartupFailed(#[from] TunnelStartupError),

    #[error("tunnel {0:?} is unknown to the connection manager")]
    UnknownTunnel(crate::rules::TunnelId),

    #[error("legacy tunnel buffer lacks required headroom/tailroom")]
    BufferHeadroomExhausted,

    #[error("the legacy library's external-TUN socket pair could not be created: {0}")]
    BridgeSetupFailed(#[from] std::io::Error),

    #[error("captured TUN handle was lost")]
    HostTunLost,

    #[error("a persisted rule references no corresponding vpn config")]
    MissingConfig,
}
