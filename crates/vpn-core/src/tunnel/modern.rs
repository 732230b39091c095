//! C4 — Modern Tunnel Client.
//!
//! Thin wrapper around `boringtun`'s userspace WireGuard core. Unlike
//! the legacy library (C5), this one never wants to own a TUN device:
//! it only transforms buffers (`encapsulate`/`decapsulate`) and leaves
//! socket I/O to the caller, so no socket-pair bridge is needed here —
//! `submit`/`receive_sink` are realized directly over an outer UDP
//! socket to the peer endpoint. That outer socket is protected (exempted
//! from the captured TUN) via C9 during bring-up so the encrypted flow
//! doesn't loop back into the tunnel it belongs to.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, TunnelStartupError};
use crate::external::ProtectSocket;
use crate::rules::VpnConfig;
use crate::tunnel::{Credentials, InboundSink, TunnelHandle, TunnelState, VpnTunnel};

const MAX_DATAGRAM: usize = 1500 + 148; // plaintext MTU + boringtun overhead headroom

/// Extracts the address assigned to this peer from a WireGuard-style
/// config blob's `[Interface]` section, e.g. `Address = 10.8.0.2/32`.
/// The library only ever hands back the config it was given (there is
/// no live handshake field carrying this), so this is the only source
/// of truth for the modern client's assigned address.
fn parse_interface_address(config_blob: &str) -> Option<IpAddr> {
    for line in config_blob.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Address") {
            let value = value.trim();
            let addr_str = value.split(',').next()?.trim();
            let addr_str = addr_str.split('/').next()?.trim();
            return addr_str.parse::<IpAddr>().ok();
        }
    }
    None
}

fn state_from_u8(v: u8) -> TunnelState {
    match v {
        0 => TunnelState::Init,
        1 => TunnelState::Connecting,
        2 => TunnelState::Connected,
        3 => TunnelState::Reconnecting,
        4 => TunnelState::Closing,
        _ => TunnelState::Closed,
    }
}

struct Session {
    tunn: Arc<Mutex<Tunn>>,
    socket: Arc<UdpSocket>,
    io_task: JoinHandle<()>,
}

/// Everything the foreground `connect()`/`submit()` calls and the
/// background reconnect supervisor both need, mirroring the legacy
/// client's `Shared` split.
struct Shared {
    protect: Arc<dyn ProtectSocket>,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
    inbound_sink: Mutex<Option<InboundSink>>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn set_state(&self, s: TunnelState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    fn state(&self) -> TunnelState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn establish(
        self: &Arc<Self>,
        private_key: [u8; 32],
        peer_public_key: [u8; 32],
        endpoint: SocketAddr,
        timeout: Duration,
    ) -> Result<Session, TunnelStartupError> {
        let static_private = x25519_dalek::StaticSecret::from(private_key);
        let peer_public = x25519_dalek::PublicKey::from(peer_public_key);
        let tunn = Tunn::new(static_private, peer_public, None, None, 0, None);

        let socket = tokio::time::timeout(timeout, UdpSocket::bind("0.0.0.0:0"))
            .await
            .map_err(|_| TunnelStartupError::Timeout)?
            .map_err(|e| {
                warn!(error = %e, "failed to bind outer wireguard socket");
                TunnelStartupError::TransportRefused
            })?;

        self.protect
            .protect(socket.as_raw_fd_number())
            .map_err(|e| TunnelStartupError::HandshakeTransient(e.to_string()))?;

        socket
            .connect(endpoint)
            .await
            .map_err(|_| TunnelStartupError::TransportRefused)?;

        let socket = Arc::new(socket);
        let tunn = Arc::new(Mutex::new(tunn));
        let io_task = self.clone().spawn_io_task(socket.clone(), tunn.clone());

        Ok(Session { tunn, socket, io_task })
    }

    fn spawn_io_task(self: Arc<Self>, socket: Arc<UdpSocket>, tunn: Arc<Mutex<Tunn>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut recv_buf = vec![0u8; MAX_DATAGRAM];
            let mut out_buf = vec![0u8; MAX_DATAGRAM];
            loop {
                if self.state() == TunnelState::Closed {
                    return;
                }
                match socket.recv(&mut recv_buf).await {
                    Ok(n) => {
                        // Pull the decrypted payload (or the outer
                        // reply-to-network bytes) out of `tunn`'s lock
                        // before awaiting anything, so a slow/backpressured
                        // inbound sink never stalls `submit`'s own
                        // `tunn.lock()` on the outbound side.
                        let to_network;
                        let to_tunnel;
                        {
                            let mut tunn = tunn.lock().await;
                            match tunn.decapsulate(None, &recv_buf[..n], &mut out_buf) {
                                TunnResult::WriteToTunnelV4(packet, _) => {
                                    to_tunnel = Some(packet.to_vec());
                                    to_network = None;
                                }
                                TunnResult::WriteToNetwork(packet) => {
                                    to_tunnel = None;
                                    to_network = Some(packet.to_vec());
                                }
                                _ => {
                                    to_tunnel = None;
                                    to_network = None;
                                }
                            }
                        }
                        if let Some(packet) = to_tunnel {
                            let sink = self.inbound_sink.lock().await.clone();
                            if let Some(sink) = sink {
                                sink(packet).await;
                            }
                        }
                        if let Some(packet) = to_network {
                            let _ = socket.send(&packet).await;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "modern tunnel socket closed");
                        return;
                    }
                }
            }
        })
    }

    /// Mirrors [`super::legacy::Shared::spawn_supervisor`]: waits for the
    /// live session's I/O task to end (peer unreachable, socket error),
    /// then cycles `reconnecting -> connecting` with bounded backoff
    /// until a fresh session comes up or `disconnect()` gives up.
    fn spawn_supervisor(
        self: Arc<Self>,
        private_key: [u8; 32],
        peer_public_key: [u8; 32],
        endpoint: SocketAddr,
        reconnect_backoff: Vec<Duration>,
        connect_timeout: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let io_task = {
                    let guard = self.session.lock().await;
                    match guard.as_ref() {
                        Some(session) => session.io_task.abort_handle(),
                        None => return,
                    }
                };
                while !io_task.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                self.set_state(TunnelState::Reconnecting);

                let mut attempt = 0usize;
                loop {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    let backoff = reconnect_backoff
                        .get(attempt)
                        .copied()
                        .unwrap_or_else(|| *reconnect_backoff.last().expect("non-empty backoff ladder"));
                    tokio::time::sleep(backoff).await;
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }

                    self.set_state(TunnelState::Connecting);
                    match self.establish(private_key, peer_public_key, endpoint, connect_timeout).await {
                        Ok(new_session) => {
                            *self.session.lock().await = Some(new_session);
                            self.set_state(TunnelState::Connected);
                            break;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "modern tunnel reconnect attempt failed, retrying");
                            attempt += 1;
                            self.set_state(TunnelState::Reconnecting);
                        }
                    }
                }
            }
        })
    }
}

pub struct ModernTunnelClient {
    shared: Arc<Shared>,
    reconnect_backoff: Vec<Duration>,
    peer_addr: Option<SocketAddr>,
    assigned_ip_sink: Option<oneshot::Sender<IpAddr>>,
    dns_sink: Option<oneshot::Sender<Vec<IpAddr>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ModernTunnelClient {
    pub fn new(protect: Arc<dyn ProtectSocket>) -> Self {
        Self::with_backoff(protect, crate::config::Config::default().reconnect_backoff)
    }

    /// Like [`Self::new`], but with an explicit reconnect backoff ladder.
    /// C6 constructs clients with the engine's configured ladder rather
    /// than always the default.
    pub fn with_backoff(protect: Arc<dyn ProtectSocket>, reconnect_backoff: Vec<Duration>) -> Self {
        assert!(!reconnect_backoff.is_empty(), "reconnect backoff ladder must not be empty");
        Self {
            shared: Arc::new(Shared {
                protect,
                state: AtomicU8::new(0),
                session: Mutex::new(None),
                inbound_sink: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
            reconnect_backoff,
            peer_addr: None,
            assigned_ip_sink: None,
            dns_sink: None,
            supervisor: None,
        }
    }
}

#[async_trait]
impl VpnTunnel for ModernTunnelClient {
    async fn connect(
        &mut self,
        config: &VpnConfig,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelStartupError> {
        self.shared.set_state(TunnelState::Connecting);
        self.shared.shutting_down.store(false, Ordering::SeqCst);

        let (private_key, peer_public_key) = match credentials {
            Credentials::KeyPair {
                private_key,
                peer_public_key,
            } => (private_key, peer_public_key),
            Credentials::UserPass { .. } => {
                self.shared.set_state(TunnelState::Closed);
                return Err(TunnelStartupError::ConfigInvalid(
                    "modern tunnel requires a key pair, not a username/password".into(),
                ));
            }
        };

        let session = match self
            .shared
            .establish(private_key, peer_public_key, config.endpoint, timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.shared.set_state(TunnelState::Closed);
                return Err(e);
            }
        };
        *self.shared.session.lock().await = Some(session);
        self.peer_addr = Some(config.endpoint);
        self.shared.set_state(TunnelState::Connected);

        let assigned_ip = parse_interface_address(&config.config_blob);
        if let Some(sink) = self.assigned_ip_sink.take() {
            if let Some(ip) = assigned_ip {
                let _ = sink.send(ip);
            }
        }
        if let Some(sink) = self.dns_sink.take() {
            let _ = sink.send(config.dns_servers.clone().unwrap_or_default());
        }

        info!(endpoint = %config.endpoint, "modern tunnel connected");

        self.supervisor = Some(self.shared.clone().spawn_supervisor(
            private_key,
            peer_public_key,
            config.endpoint,
            self.reconnect_backoff.clone(),
            timeout,
        ));

        Ok(TunnelHandle {
            assigned_ip,
            remote_endpoint: config.endpoint,
        })
    }

    async fn submit(&self, plaintext_packet: Vec<u8>) -> Result<(), CoreError> {
        if self.shared.state() != TunnelState::Connected {
            return Ok(()); // not connected: caller's queue already handled drop/enqueue
        }
        let session = self.shared.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Ok(());
        };
        let mut out_buf = vec![0u8; MAX_DATAGRAM];
        let mut tunn = session.tunn.lock().await;
        match tunn.encapsulate(&plaintext_packet, &mut out_buf) {
            TunnResult::WriteToNetwork(packet) => {
                let _ = session.socket.send(packet).await;
            }
            TunnResult::Err(e) => {
                debug!(?e, "wireguard encapsulation error");
            }
            _ => {}
        }
        Ok(())
    }

    fn receive_sink(&mut self, sink: InboundSink) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            *shared.inbound_sink.lock().await = Some(sink);
        });
    }

    fn assigned_ip_sink(&mut self, sink: oneshot::Sender<IpAddr>) {
        self.assigned_ip_sink = Some(sink);
    }

    fn dns_sink(&mut self, sink: oneshot::Sender<Vec<IpAddr>>) {
        self.dns_sink = Some(sink);
    }

    async fn disconnect(&mut self) {
        if self.shared.state() == TunnelState::Closed {
            return;
        }
        self.shared.set_state(TunnelState::Closing);
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        if let Some(session) = self.shared.session.lock().await.take() {
            session.io_task.abort();
        }
        self.shared.set_state(TunnelState::Closed);
    }

    fn state(&self) -> TunnelState {
        self.shared.state()
    }
}

trait RawFdNumber {
    fn as_raw_fd_number(&self) -> i32;
}

impl RawFdNumber for UdpSocket {
    #[cfg(unix)]
    fn as_raw_fd_number(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd()
    }

    #[cfg(not(unix))]
    fn as_raw_fd_number(&self) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::tests::AllowAllProtect;

    #[tokio::test]
    async fn disconnect_before_connect_is_a_no_op() {
        let mut client = ModernTunnelClient::new(Arc::new(AllowAllProtect));
        assert_eq!(client.state(), TunnelState::Init);
        client.disconnect().await;
        assert_eq!(client.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn double_disconnect_is_idempotent() {
        let mut client = ModernTunnelClient::new(Arc::new(AllowAllProtect));
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), TunnelState::Closed);
    }

    #[test]
    fn interface_address_is_parsed_with_cidr_stripped() {
        let blob = "[Interface]\nPrivateKey = abc\nAddress = 10.8.0.2/32\nDNS = 1.1.1.1\n";
        assert_eq!(
            parse_interface_address(blob),
            Some("10.8.0.2".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn interface_address_absent_is_none() {
        let blob = "[Interface]\nPrivateKey = abc\n";
        assert_eq!(parse_interface_address(blob), None);
    }

    #[tokio::test]
    async fn user_pass_credentials_are_rejected() {
        let mut client = ModernTunnelClient::new(Arc::new(AllowAllProtect));
        let config = VpnConfig {
            tunnel_id: crate::rules::TunnelId(1),
            protocol: crate::rules::TunnelProtocol::Modern,
            config_blob: "[Interface]\n".to_string(),
            endpoint: "127.0.0.1:51820".parse().unwrap(),
            auth_material_ref: "ref".to_string(),
            dns_servers: None,
            allowed_ips: None,
        };
        let err = client
            .connect(
                &config,
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelStartupError::ConfigInvalid(_)));
        assert_eq!(client.state(), TunnelState::Closed);
    }
}
