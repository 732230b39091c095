//! Uniform contract shared by both tunnel-client variants (C4 modern,
//! C5 legacy). Neither the router nor the connection manager ever
//! matches on which variant is live beyond the tagged `TunnelKind`
//! stored in a slot — dynamic dispatch via this trait object is
//! sufficient and a tagged union at the call site would work equally
//! well; this core uses the trait object so C6 can hold either behind
//! one handle type.

pub mod bridge;
pub mod legacy;
pub mod modern;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{CoreError, TunnelStartupError};
use crate::rules::VpnConfig;

/// Multi-protocol authentication material. Credentials are resolved by
/// the caller (outside this core) from an opaque persistence reference
/// and handed in at `connect()` time; they are never read from disk here.
#[derive(Debug, Clone)]
pub enum Credentials {
    KeyPair {
        private_key: [u8; 32],
        peer_public_key: [u8; 32],
    },
    UserPass {
        username: String,
        password: String,
    },
}

/// Handle returned on a successful `connect()`.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    pub assigned_ip: Option<IpAddr>,
    pub remote_endpoint: SocketAddr,
}

/// Identical across variants: `init -> connecting -> connected ->
/// {reconnecting -> connecting | closing -> closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// Callback invoked once per decrypted inbound plaintext packet. Runs on
/// the client's own I/O task and is awaited there, so it is free to
/// apply real backpressure (a full shared inbound channel blocks the
/// tunnel's own I/O task rather than dropping the packet) — it must
/// never return a future that resolves before the packet is actually
/// handed off.
pub type InboundSink =
    std::sync::Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Uniform operations every tunnel client exposes, modern and legacy
/// alike, so C6 can drive either behind one trait object.
#[async_trait]
pub trait VpnTunnel: Send + Sync {
    /// Establishes the tunnel within `timeout`. Retryable failure kinds
    /// (`Timeout`, `TransportRefused`, `HandshakeTransient`) are distinct
    /// from fatal ones (`AuthRejected`, `ConfigInvalid`, `ProtocolMismatch`)
    /// so the caller can decide whether to back off and retry.
    async fn connect(
        &mut self,
        config: &VpnConfig,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelStartupError>;

    /// Non-blocking; never performs network I/O inline. Called only on a
    /// packet that has already cleared the caller's per-slot queue.
    async fn submit(&self, plaintext_packet: Vec<u8>) -> Result<(), CoreError>;

    /// Installs the single inbound callback. Replaces any previous one.
    fn receive_sink(&mut self, sink: InboundSink);

    /// One-shot: fires when the peer assigns an address.
    fn assigned_ip_sink(&mut self, sink: oneshot::Sender<IpAddr>);

    /// One-shot: fires when the peer provides DNS servers.
    fn dns_sink(&mut self, sink: oneshot::Sender<Vec<IpAddr>>);

    /// Idempotent; stops `receive_sink` firing and releases resources.
    /// Safe to call from any state, including twice in a row.
    async fn disconnect(&mut self);

    /// Current state, without blocking.
    fn state(&self) -> TunnelState;
}
