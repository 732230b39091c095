//! C5 — Legacy Tunnel Client, the hard part.
//!
//! The legacy library is structured around owning its own TUN and
//! driving it from its internal event loop. It is an external
//! collaborator (its cryptographic core is consumed as a library, out of
//! scope here) so this client only owns the bridge around it: an
//! external-TUN-factory socket pair (see [`super::bridge`]) plus the
//! buffer-headroom discipline the library requires when handed a
//! plaintext packet, plus forwarding of its "protect this socket" upcall
//! to C9 — and the reconnect supervisor that re-establishes the bridge
//! and re-runs the library on an unexpected disconnection, per the
//! `connected -> reconnecting -> connecting` state machine every tunnel
//! client shares.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::PacketBuffer;
use crate::error::{CoreError, TunnelStartupError};
use crate::external::ProtectSocket;
use crate::rules::VpnConfig;
use crate::tunnel::bridge::{self, BridgeEnd};
use crate::tunnel::{Credentials, InboundSink, TunnelHandle, TunnelState, VpnTunnel};

const DEFAULT_MTU: u32 = 1500;

/// Configuration the legacy library reports back once it has completed
/// its handshake: assigned address, DNS servers, and an optional raw MTU
/// string (parsed by this client, not the library).
#[derive(Debug, Clone)]
pub struct LegacyLibraryConfig {
    pub assigned_ip: Ipv4Addr,
    pub dns_servers: Vec<IpAddr>,
    pub mtu_option: Option<String>,
}

/// The external legacy library's side of the bridge. A production
/// embedder implements this against the real library's FFI bindings
/// (handed `lib_fd` as its "TUN"); this core ships only an in-memory
/// stand-in for tests.
#[async_trait]
pub trait LegacyLibrary: Send + Sync {
    /// Drives the library's event loop against `lib_fd` until
    /// `shutdown` resolves. Reports its negotiated configuration on
    /// `config_tx` once (and only once) the handshake completes.
    async fn run(
        &self,
        lib_fd: BridgeEnd,
        protect: Arc<dyn ProtectSocket>,
        config_blob: String,
        credentials: Credentials,
        config_tx: oneshot::Sender<Result<LegacyLibraryConfig, TunnelStartupError>>,
        shutdown: oneshot::Receiver<()>,
    );
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

/// One live bridge session: the app-side bridge end, the library-driver
/// task, and the shutdown handle used to stop that specific library run.
/// Torn down and replaced wholesale on every reconnect.
struct Session {
    app_fd: Arc<BridgeEnd>,
    io_task: JoinHandle<()>,
    library_shutdown: oneshot::Sender<()>,
}

/// Everything the foreground `connect()`/`submit()` calls and the
/// background reconnect supervisor both need. Held behind one `Arc` so
/// the supervisor task can drive a fresh `establish()` without ever
/// touching a `&mut LegacyTunnelClient`.
struct Shared {
    protect: Arc<dyn ProtectSocket>,
    library: Arc<dyn LegacyLibrary>,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
    mtu: AtomicU32,
    inbound_sink: Mutex<Option<InboundSink>>,
    shutting_down: AtomicBool,
    /// Per-packet buffer layout handed across the bridge on `submit`.
    /// Defaults to [`crate::buffer::MIN_HEADROOM`]/[`crate::buffer::MIN_TAILROOM`]
    /// — these values must match between allocation and the library's
    /// configured headroom; kept configurable so a test can construct a
    /// client whose allocation no longer matches the library's
    /// requirement and observe `submit` fail closed instead of silently
    /// forwarding an under-sized buffer.
    headroom: AtomicU32,
    tailroom: AtomicU32,
}

impl Shared {
    fn set_state(&self, s: TunnelState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    fn state(&self) -> TunnelState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Creates a fresh bridge, hands `lib_fd` to the library, and waits
    /// (bounded by `timeout`) for it to report its negotiated config.
    /// Used both by the initial `connect()` and by every reconnect
    /// attempt — the two share this exact sequence. Takes the shared
    /// state as an explicit `&Arc<Shared>` (rather than as a `self`
    /// receiver) since `self: &Arc<Self>` isn't a supported receiver
    /// type; `spawn_io_task` below needs its own owned `Arc<Shared>`.
    async fn establish(
        shared: &Arc<Shared>,
        config_blob: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<(Session, LegacyLibraryConfig), TunnelStartupError> {
        let (app_fd, lib_fd) =
            bridge::create_pair().map_err(|e| TunnelStartupError::HandshakeTransient(e.to_string()))?;

        let (config_tx, config_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let library = shared.library.clone();
        let protect = shared.protect.clone();
        let config_blob = config_blob.to_string();
        tokio::spawn(async move {
            library
                .run(lib_fd, protect, config_blob, credentials, config_tx, shutdown_rx)
                .await;
        });

        let lib_config = match tokio::time::timeout(timeout, config_rx).await {
            Ok(Ok(Ok(cfg))) => cfg,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(TunnelStartupError::HandshakeTransient(
                    "library dropped the config channel".into(),
                ))
            }
            Err(_) => return Err(TunnelStartupError::Timeout),
        };

        let app_fd = Arc::new(app_fd);
        let io_task = shared.clone().spawn_io_task(app_fd.clone());

        Ok((
            Session {
                app_fd,
                io_task,
                library_shutdown: shutdown_tx,
            },
            lib_config,
        ))
    }

    fn spawn_io_task(self: Arc<Self>, app_fd: Arc<BridgeEnd>) -> JoinHandle<()> {
        let mtu = self.mtu.load(Ordering::Relaxed).max(1) as usize;
        tokio::spawn(async move {
            let mut recv_buf = vec![0u8; mtu + 256];
            loop {
                if self.state() == TunnelState::Closed {
                    return;
                }
                match app_fd.recv(&mut recv_buf).await {
                    Ok(0) => return,
                    Ok(n) => {
                        let packet = PacketBuffer::with_payload(&recv_buf[..n]);
                        let sink = self.inbound_sink.lock().await.clone();
                        if let Some(sink) = sink {
                            sink(packet.payload().to_vec()).await;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "legacy tunnel bridge closed");
                        return;
                    }
                }
            }
        })
    }

    fn apply_mtu_option(&self, mtu_option: Option<String>) {
        let mtu = match mtu_option {
            None => DEFAULT_MTU,
            Some(raw) => match raw.parse::<u32>() {
                Ok(mtu) => mtu,
                Err(e) => {
                    warn!(error = %e, raw = %raw, "failed to parse MTU option from legacy library, defaulting to 1500");
                    DEFAULT_MTU
                }
            },
        };
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    /// Background supervisor: waits for the live session's I/O task to
    /// end (the signal that the peer dropped the data channel or the
    /// bridge closed), then re-enters `reconnecting` and retries
    /// `establish` with the bounded backoff ladder until it succeeds or
    /// `disconnect()` has asked it to give up. Never leaks a packet to
    /// any other slot: this client only ever touches its own session.
    fn spawn_supervisor(
        self: Arc<Self>,
        config_blob: String,
        credentials: Credentials,
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
                    match Shared::establish(&self, &config_blob, credentials.clone(), connect_timeout).await {
                        Ok((new_session, lib_config)) => {
                            self.apply_mtu_option(lib_config.mtu_option);
                            *self.session.lock().await = Some(new_session);
                            self.set_state(TunnelState::Connected);
                            break;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "legacy tunnel reconnect attempt failed, retrying");
                            attempt += 1;
                            self.set_state(TunnelState::Reconnecting);
                        }
                    }
                }
            }
        })
    }
}

pub struct LegacyTunnelClient {
    shared: Arc<Shared>,
    reconnect_backoff: Vec<Duration>,
    assigned_ip_sink: Option<oneshot::Sender<IpAddr>>,
    dns_sink: Option<oneshot::Sender<Vec<IpAddr>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl LegacyTunnelClient {
    pub fn new(protect: Arc<dyn ProtectSocket>, library: Arc<dyn LegacyLibrary>) -> Self {
        Self::with_backoff(protect, library, crate::config::Config::default().reconnect_backoff)
    }

    /// Like [`Self::new`], but with an explicit reconnect backoff ladder
    /// (0.5s, 1s, 2s, 4s, 8s, capped at the last entry by default).
    /// C6 constructs clients with the engine's configured ladder rather
    /// than always the default.
    pub fn with_backoff(
        protect: Arc<dyn ProtectSocket>,
        library: Arc<dyn LegacyLibrary>,
        reconnect_backoff: Vec<Duration>,
    ) -> Self {
        assert!(!reconnect_backoff.is_empty(), "reconnect backoff ladder must not be empty");
        Self {
            shared: Arc::new(Shared {
                protect,
                library,
                state: AtomicU8::new(0),
                session: Mutex::new(None),
                mtu: AtomicU32::new(DEFAULT_MTU),
                inbound_sink: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                headroom: AtomicU32::new(crate::buffer::MIN_HEADROOM as u32),
                tailroom: AtomicU32::new(crate::buffer::MIN_TAILROOM as u32),
            }),
            reconnect_backoff,
            assigned_ip_sink: None,
            dns_sink: None,
            supervisor: None,
        }
    }

    /// Like [`Self::with_backoff`], but with an explicit buffer
    /// headroom/tailroom. Exists so a test can construct a client whose
    /// allocation no longer matches the library's requirement and observe
    /// `submit` fail closed instead of silently forwarding an
    /// under-sized buffer.
    #[cfg(test)]
    pub fn with_backoff_and_layout(
        protect: Arc<dyn ProtectSocket>,
        library: Arc<dyn LegacyLibrary>,
        reconnect_backoff: Vec<Duration>,
        headroom: usize,
        tailroom: usize,
    ) -> Self {
        let mut client = Self::with_backoff(protect, library, reconnect_backoff);
        client.shared.headroom.store(headroom as u32, Ordering::SeqCst);
        client.shared.tailroom.store(tailroom as u32, Ordering::SeqCst);
        client
    }

    #[cfg(test)]
    fn mtu(&self) -> u32 {
        self.shared.mtu.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VpnTunnel for LegacyTunnelClient {
    async fn connect(
        &mut self,
        config: &VpnConfig,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelStartupError> {
        self.shared.set_state(TunnelState::Connecting);
        self.shared.shutting_down.store(false, Ordering::SeqCst);

        let (session, lib_config) = match self
            .shared
            .establish(&config.config_blob, credentials.clone(), timeout)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.set_state(TunnelState::Closed);
                return Err(e);
            }
        };
        self.shared.apply_mtu_option(lib_config.mtu_option.clone());
        *self.shared.session.lock().await = Some(session);
        self.shared.set_state(TunnelState::Connected);

        if let Some(sink) = self.assigned_ip_sink.take() {
            let _ = sink.send(IpAddr::V4(lib_config.assigned_ip));
        }
        if let Some(sink) = self.dns_sink.take() {
            let _ = sink.send(lib_config.dns_servers.clone());
        }

        self.supervisor = Some(self.shared.clone().spawn_supervisor(
            config.config_blob.clone(),
            credentials,
            self.reconnect_backoff.clone(),
            timeout,
        ));

        Ok(TunnelHandle {
            assigned_ip: Some(IpAddr::V4(lib_config.assigned_ip)),
            remote_endpoint: config.endpoint,
        })
    }

    async fn submit(&self, plaintext_packet: Vec<u8>) -> Result<(), CoreError> {
        if self.shared.state() != TunnelState::Connected {
            // Mid-`reconnecting`/`connecting`: the caller's per-slot
            // queue still holds this packet, so leaving it un-submitted
            // here (rather than silently consuming it) is what makes it
            // available to flush once the session comes back.
            return Ok(());
        }
        let app_fd = {
            let guard = self.shared.session.lock().await;
            match guard.as_ref() {
                Some(session) => session.app_fd.clone(),
                None => return Ok(()),
            }
        };

        let headroom = self.shared.headroom.load(Ordering::Relaxed) as usize;
        let tailroom = self.shared.tailroom.load(Ordering::Relaxed) as usize;
        let buffer = PacketBuffer::with_headroom_tailroom(&plaintext_packet, headroom, tailroom)?;
        buffer.check_headroom_law()?;

        match app_fd.send(buffer.payload()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "legacy tunnel bridge write failed");
                Ok(())
            }
        }
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
            let _ = session.library_shutdown.send(());
            session.io_task.abort();
        }
        self.shared.set_state(TunnelState::Closed);
    }

    fn state(&self) -> TunnelState {
        self.shared.state()
    }
}

/// Test/demo-only stand-ins for the external legacy library. Not gated on
/// `cfg(test)`: downstream crates (the demo CLI, integration tests) need
/// this available in ordinary builds, not just `vpn-core`'s own test
/// build.
pub mod test_support {
    use super::*;

    /// Loopback stand-in for the legacy library: reports a fixed
    /// configuration immediately, then echoes whatever the core writes
    /// to `lib_fd` back as an inbound packet. Good enough to exercise
    /// the bridge and the client's state machine without a real library.
    pub struct LoopbackLegacyLibrary {
        pub mtu_option: Option<String>,
    }

    #[async_trait]
    impl LegacyLibrary for LoopbackLegacyLibrary {
        async fn run(
            &self,
            lib_fd: BridgeEnd,
            _protect: Arc<dyn ProtectSocket>,
            _config_blob: String,
            _credentials: Credentials,
            config_tx: oneshot::Sender<Result<LegacyLibraryConfig, TunnelStartupError>>,
            mut shutdown: oneshot::Receiver<()>,
        ) {
            let _ = config_tx.send(Ok(LegacyLibraryConfig {
                assigned_ip: Ipv4Addr::new(10, 8, 0, 2),
                dns_servers: vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))],
                mtu_option: self.mtu_option.clone(),
            }));

            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    result = lib_fd.recv(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                let _ = lib_fd.send(&buf[..n]).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Like [`LoopbackLegacyLibrary`], but its `run()` exits on its own
    /// after the given number of packets round-trip — simulating a
    /// peer-initiated data-channel drop, so tests can exercise the
    /// reconnect supervisor without waiting on a real backoff-triggering
    /// network event.
    pub struct DropAfterNLibrary {
        pub drop_after: std::sync::atomic::AtomicUsize,
    }

    impl DropAfterNLibrary {
        pub fn new(drop_after: usize) -> Self {
            Self {
                drop_after: std::sync::atomic::AtomicUsize::new(drop_after),
            }
        }
    }

    #[async_trait]
    impl LegacyLibrary for DropAfterNLibrary {
        async fn run(
            &self,
            lib_fd: BridgeEnd,
            _protect: Arc<dyn ProtectSocket>,
            _config_blob: String,
            _credentials: Credentials,
            config_tx: oneshot::Sender<Result<LegacyLibraryConfig, TunnelStartupError>>,
            mut shutdown: oneshot::Receiver<()>,
        ) {
            let _ = config_tx.send(Ok(LegacyLibraryConfig {
                assigned_ip: Ipv4Addr::new(10, 8, 0, 2),
                dns_servers: vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))],
                mtu_option: None,
            }));

            let mut buf = vec![0u8; 2048];
            loop {
                if self.drop_after.load(Ordering::SeqCst) == 0 {
                    return;
                }
                tokio::select! {
                    _ = &mut shutdown => return,
                    result = lib_fd.recv(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                let _ = lib_fd.send(&buf[..n]).await;
                                self.drop_after.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
        }
    }
}
