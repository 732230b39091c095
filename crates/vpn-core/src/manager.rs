//! C6 — Tunnel Connection Manager.
//!
//! Owns every live tunnel slot: bring-up (protocol detection, client
//! construction, connect with retry/backoff), a bounded per-slot
//! outbound queue that drops the oldest packet rather than blocking the
//! router, and a single fan-in channel carrying every slot's decrypted
//! inbound packets back out to the engine's inbound loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{CoreError, TunnelStartupError};
use crate::events::{Counters, Event};
use crate::external::ProtectSocket;
use crate::protocol;
use crate::rules::{TunnelId, TunnelProtocol, VpnConfig};
use crate::tunnel::legacy::{LegacyLibrary, LegacyTunnelClient};
use crate::tunnel::modern::ModernTunnelClient;
use crate::tunnel::{Credentials, TunnelState, VpnTunnel};

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

/// Bounded queue that drops the *oldest* entry on overflow rather than
/// rejecting the newest: a router that just classified a packet's owner
/// must never block waiting for a slow/stalled tunnel.
struct OutboundQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
    counters: Arc<Counters>,
}

impl OutboundQueue {
    fn new(capacity: usize, counters: Arc<Counters>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            counters,
        }
    }

    async fn push(&self, packet: Vec<u8>) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.counters.record_dropped_queue_full();
        }
        queue.push_back(packet);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(packet) = self.inner.lock().await.pop_front() {
                return packet;
            }
            self.notify.notified().await;
        }
    }

    /// Re-queues a packet that was popped but couldn't be handed to the
    /// tunnel after all (it reconnected away between the two checks).
    /// Goes back to the front so ordering relative to packets queued
    /// after it is preserved.
    async fn push_front(&self, packet: Vec<u8>) {
        let mut queue = self.inner.lock().await;
        queue.push_front(packet);
        drop(queue);
        self.notify.notify_one();
    }
}

struct TunnelSlot {
    tunnel: Mutex<Box<dyn VpnTunnel>>,
    queue: Arc<OutboundQueue>,
    state: Arc<AtomicU8>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

/// Everything C6 needs from outside its own process to construct tunnel
/// clients: socket protection for the modern client's outer UDP socket,
/// and a legacy-library factory for the legacy client's bridge driver.
pub trait TunnelClientFactory: Send + Sync {
    fn legacy_library(&self) -> Arc<dyn LegacyLibrary>;
}

pub struct TunnelConnectionManager {
    slots: RwLock<HashMap<TunnelId, Arc<TunnelSlot>>>,
    protect: Arc<dyn ProtectSocket>,
    factory: Arc<dyn TunnelClientFactory>,
    config: Config,
    counters: Arc<Counters>,
    events_tx: broadcast::Sender<Event>,
    inbound_tx: mpsc::Sender<(TunnelId, Vec<u8>)>,
}

impl TunnelConnectionManager {
    pub fn new(
        protect: Arc<dyn ProtectSocket>,
        factory: Arc<dyn TunnelClientFactory>,
        config: Config,
        counters: Arc<Counters>,
        events_tx: broadcast::Sender<Event>,
        inbound_tx: mpsc::Sender<(TunnelId, Vec<u8>)>,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            protect,
            factory,
            config,
            counters,
            events_tx,
            inbound_tx,
        }
    }

    /// Brings a tunnel slot up: detects the protocol, constructs the
    /// matching client, and connects with retry/backoff on retryable
    /// failures. Returns once connected, or once a fatal failure occurs.
    pub async fn bring_up(
        &self,
        vpn_config: &VpnConfig,
        credentials: Credentials,
    ) -> Result<(), CoreError> {
        let detected = protocol::detect_protocol(&vpn_config.config_blob);
        if detected != vpn_config.protocol {
            let _ = self.events_tx.send(Event::TunnelStartupFailed {
                tunnel_id: vpn_config.tunnel_id,
                reason: TunnelStartupError::ProtocolMismatch.to_string(),
                retryable: false,
            });
            return Err(TunnelStartupError::ProtocolMismatch.into());
        }

        let mut tunnel: Box<dyn VpnTunnel> = match detected {
            TunnelProtocol::Modern => Box::new(ModernTunnelClient::with_backoff(
                self.protect.clone(),
                self.config.reconnect_backoff.clone(),
            )),
            TunnelProtocol::Legacy => Box::new(LegacyTunnelClient::with_backoff(
                self.protect.clone(),
                self.factory.legacy_library(),
                self.config.reconnect_backoff.clone(),
            )),
        };

        let (assigned_ip_tx, assigned_ip_rx) = tokio::sync::oneshot::channel();
        let (dns_tx, dns_rx) = tokio::sync::oneshot::channel();
        tunnel.assigned_ip_sink(assigned_ip_tx);
        tunnel.dns_sink(dns_tx);
        {
            let events_tx = self.events_tx.clone();
            let tunnel_id = vpn_config.tunnel_id;
            tokio::spawn(async move {
                if let Ok(ip) = assigned_ip_rx.await {
                    let _ = events_tx.send(Event::TunnelAssignedIp { tunnel_id, ip });
                }
            });
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                if let Ok(dns_servers) = dns_rx.await {
                    let _ = events_tx.send(Event::TunnelAssignedDns { tunnel_id, dns_servers });
                }
            });
        }

        let mut attempt = 0usize;
        loop {
            match tunnel
                .connect(vpn_config, credentials.clone(), self.config.connect_timeout)
                .await
            {
                Ok(handle) => {
                    info!(tunnel_id = ?vpn_config.tunnel_id, endpoint = %handle.remote_endpoint, "tunnel connected");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    let _ = self.events_tx.send(Event::TunnelStartupFailed {
                        tunnel_id: vpn_config.tunnel_id,
                        reason: e.to_string(),
                        retryable: true,
                    });
                    let backoff = self.config.backoff_for_attempt(attempt);
                    warn!(tunnel_id = ?vpn_config.tunnel_id, attempt, ?backoff, error = %e, "tunnel connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    let _ = self.events_tx.send(Event::TunnelStartupFailed {
                        tunnel_id: vpn_config.tunnel_id,
                        reason: e.to_string(),
                        retryable: false,
                    });
                    return Err(e.into());
                }
            }
        }

        let state = Arc::new(AtomicU8::new(TunnelState::Connected as u8));
        let queue = Arc::new(OutboundQueue::new(self.config.tunnel_queue_depth, self.counters.clone()));

        let inbound_tx = self.inbound_tx.clone();
        let tunnel_id = vpn_config.tunnel_id;
        tunnel.receive_sink(Arc::new(move |packet: Vec<u8>| {
            let inbound_tx = inbound_tx.clone();
            // Real backpressure, not drop-on-full: this runs on the
            // tunnel's own I/O task, which is exactly the task that
            // should block here if the engine can't keep up writing to
            // the captured TUN, throttling the remote peer instead of
            // silently losing decrypted plaintext.
            Box::pin(async move {
                let _ = inbound_tx.send((tunnel_id, packet)).await;
            })
        }));

        let slot = Arc::new(TunnelSlot {
            tunnel: Mutex::new(tunnel),
            queue: queue.clone(),
            state: state.clone(),
            drain_task: Mutex::new(None),
        });

        let drain_slot = slot.clone();
        let drain_task = tokio::spawn(async move {
            loop {
                if state_from_u8(drain_slot.state.load(Ordering::SeqCst)) == TunnelState::Closed {
                    return;
                }
                // Don't pop while the client itself is mid-`reconnecting`
                // or `connecting`: popping here and handing the packet to
                // a client that isn't `connected` would lose it, since
                // `submit` on a non-connected client just drops what it's
                // given. Leaving it queued is what makes a reconnect
                // flush the packets that were waiting for it.
                {
                    let tunnel = drain_slot.tunnel.lock().await;
                    if tunnel.state() != TunnelState::Connected {
                        drop(tunnel);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        continue;
                    }
                }
                let packet = drain_slot.queue.pop().await;
                let tunnel = drain_slot.tunnel.lock().await;
                if tunnel.state() != TunnelState::Connected {
                    // Reconnected away between the check above and now;
                    // put the packet back at the front rather than drop it.
                    drain_slot.queue.push_front(packet).await;
                    continue;
                }
                if let Err(e) = tunnel.submit(packet).await {
                    warn!(error = %e, "tunnel submit failed");
                }
            }
        });
        *slot.drain_task.lock().await = Some(drain_task);

        self.slots.write().await.insert(vpn_config.tunnel_id, slot);
        let _ = self.events_tx.send(Event::TunnelStateChanged {
            tunnel_id: vpn_config.tunnel_id,
            state: TunnelState::Connected,
        });

        Ok(())
    }

    /// Enqueues a plaintext packet for `tunnel_id`'s outbound queue.
    /// Drops the oldest queued packet on overflow. Returns
    /// [`CoreError::UnknownTunnel`] if the slot doesn't exist (torn down
    /// mid-flight, or never brought up) — the router treats this the
    /// same as a bypass-worthy miss.
    pub async fn submit(&self, tunnel_id: TunnelId, packet: Vec<u8>) -> Result<(), CoreError> {
        let slot = self
            .slots
            .read()
            .await
            .get(&tunnel_id)
            .cloned()
            .ok_or(CoreError::UnknownTunnel(tunnel_id))?;
        slot.queue.push(packet).await;
        Ok(())
    }

    /// Idempotent: tearing down a tunnel that isn't up is a no-op.
    pub async fn tear_down(&self, tunnel_id: TunnelId) {
        let slot = self.slots.write().await.remove(&tunnel_id);
        let Some(slot) = slot else { return };

        slot.state.store(TunnelState::Closed as u8, Ordering::SeqCst);
        if let Some(task) = slot.drain_task.lock().await.take() {
            task.abort();
        }
        slot.tunnel.lock().await.disconnect().await;

        let _ = self.events_tx.send(Event::TunnelStateChanged {
            tunnel_id,
            state: TunnelState::Closed,
        });
    }

    pub async fn is_up(&self, tunnel_id: TunnelId) -> bool {
        self.slots.read().await.contains_key(&tunnel_id)
    }

    pub async fn live_tunnel_ids(&self) -> Vec<TunnelId> {
        self.slots.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::tests::AllowAllProtect;
    use crate::tunnel::legacy::test_support::LoopbackLegacyLibrary;
    use std::net::SocketAddr;

    struct TestFactory;
    impl TunnelClientFactory for TestFactory {
        fn legacy_library(&self) -> Arc<dyn LegacyLibrary> {
            Arc::new(LoopbackLegacyLibrary { mtu_option: None })
        }
    }

    /// Like [`TestFactory`], but its library drops the data channel after
    /// one round-tripped packet, so tests can drive the reconnect
    /// supervisor without a real network flake.
    struct FlakyFactory;
    impl TunnelClientFactory for FlakyFactory {
        fn legacy_library(&self) -> Arc<dyn LegacyLibrary> {
            Arc::new(crate::tunnel::legacy::test_support::DropAfterNLibrary::new(1))
        }
    }

    fn manager() -> (TunnelConnectionManager, mpsc::Receiver<(TunnelId, Vec<u8>)>) {
        manager_with_config(Config::default())
    }

    fn manager_with_config(config: Config) -> (TunnelConnectionManager, mpsc::Receiver<(TunnelId, Vec<u8>)>) {
        manager_with(Arc::new(TestFactory), config)
    }

    fn manager_with(
        factory: Arc<dyn TunnelClientFactory>,
        config: Config,
    ) -> (TunnelConnectionManager, mpsc::Receiver<(TunnelId, Vec<u8>)>) {
        let (events_tx, _) = broadcast::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let manager = TunnelConnectionManager::new(
            Arc::new(AllowAllProtect),
            factory,
            config,
            Arc::new(Counters::new()),
            events_tx,
            inbound_tx,
        );
        (manager, inbound_rx)
    }

    fn legacy_config(tunnel_id: TunnelId) -> VpnConfig {
        VpnConfig {
            tunnel_id,
            protocol: TunnelProtocol::Legacy,
            config_blob: "client\nremote vpn.example.com 1194\n".to_string(),
            endpoint: "127.0.0.1:1194".parse::<SocketAddr>().unwrap(),
            auth_material_ref: "ref".to_string(),
            dns_servers: None,
            allowed_ips: None,
        }
    }

    #[tokio::test]
    async fn bring_up_then_submit_routes_through_drain_task() {
        let (manager, mut inbound_rx) = manager();
        let tunnel_id = TunnelId(1);
        manager
            .bring_up(
                &legacy_config(tunnel_id),
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap();

        assert!(manager.is_up(tunnel_id).await);
        manager.submit(tunnel_id, vec![7u8; 10]).await.unwrap();

        let (id, packet) = tokio::time::timeout(std::time::Duration::from_millis(500), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, tunnel_id);
        assert_eq!(packet.len(), 10);
    }

    #[tokio::test]
    async fn bring_up_broadcasts_assigned_ip_and_dns_events() {
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let manager = TunnelConnectionManager::new(
            Arc::new(AllowAllProtect),
            Arc::new(TestFactory),
            Config::default(),
            Arc::new(Counters::new()),
            events_tx,
            inbound_tx,
        );
        let tunnel_id = TunnelId(5);
        manager
            .bring_up(
                &legacy_config(tunnel_id),
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap();

        let mut saw_ip = false;
        let mut saw_dns = false;
        for _ in 0..8 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), events_rx.recv()).await {
                Ok(Ok(Event::TunnelAssignedIp { tunnel_id: id, .. })) if id == tunnel_id => saw_ip = true,
                Ok(Ok(Event::TunnelAssignedDns { tunnel_id: id, .. })) if id == tunnel_id => saw_dns = true,
                Ok(Ok(_)) => {}
                _ => break,
            }
            if saw_ip && saw_dns {
                break;
            }
        }
        assert!(saw_ip, "expected a TunnelAssignedIp event");
        assert!(saw_dns, "expected a TunnelAssignedDns event");
    }

    #[tokio::test]
    async fn submit_to_unknown_tunnel_is_an_error() {
        let (manager, _inbound_rx) = manager();
        let err = manager.submit(TunnelId(99), vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownTunnel(TunnelId(99))));
    }

    #[tokio::test]
    async fn tear_down_of_unknown_tunnel_is_a_no_op() {
        let (manager, _inbound_rx) = manager();
        manager.tear_down(TunnelId(42)).await;
    }

    #[tokio::test]
    async fn tear_down_removes_slot() {
        let (manager, _inbound_rx) = manager();
        let tunnel_id = TunnelId(2);
        manager
            .bring_up(
                &legacy_config(tunnel_id),
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap();
        assert!(manager.is_up(tunnel_id).await);
        manager.tear_down(tunnel_id).await;
        assert!(!manager.is_up(tunnel_id).await);
    }

    #[tokio::test]
    async fn mismatched_protocol_is_rejected_before_connecting() {
        let (manager, _inbound_rx) = manager();
        let mut bad = legacy_config(TunnelId(3));
        bad.protocol = TunnelProtocol::Modern;
        let err = manager
            .bring_up(
                &bad,
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::TunnelStartupFailed(TunnelStartupError::ProtocolMismatch)
        ));
    }

    #[tokio::test]
    async fn packets_submitted_during_reconnect_are_queued_not_dropped() {
        let mut config = Config::default();
        config.reconnect_backoff = vec![std::time::Duration::from_millis(20)];
        let (manager, mut inbound_rx) = manager_with(Arc::new(FlakyFactory), config);

        let tunnel_id = TunnelId(4);
        manager
            .bring_up(
                &legacy_config(tunnel_id),
                Credentials::UserPass {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap();

        // One round trip consumes the library's quota, so the next
        // recv on the bridge returns EOF and the supervisor enters
        // `reconnecting`.
        manager.submit(tunnel_id, vec![1u8; 8]).await.unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(500), inbound_rx.recv())
            .await
            .unwrap();

        // Give the drain task a moment to observe the non-connected
        // state and stop popping.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        // Submitted while the client is mid-reconnect (since the same
        // exhausted library keeps refusing, it never comes back up in
        // this test) — this packet must stay queued, not be silently
        // handed to a non-connected client and lost.
        manager.submit(tunnel_id, vec![2u8; 8]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Nothing should have made it to the inbound channel from this
        // second packet (the client never echoes a packet it never
        // received), but more importantly the manager must still report
        // the tunnel as up — the slot itself isn't torn down just
        // because its client is reconnecting.
        assert!(manager.is_up(tunnel_id).await);

        manager.tear_down(tunnel_id).await;
    }
}
