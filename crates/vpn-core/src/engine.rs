//! C8 — VPN Engine.
//!
//! Orchestrates everything else: brings the rule cache, connection
//! tracker, tunnel manager, and router up together on `start`, runs the
//! outbound/inbound pump loops against the host TUN for the life of the
//! engine, periodically reconciles live tunnels against the persisted
//! rule set, and tears everything down cleanly on `stop`. Both `start`
//! and `stop` are idempotent — a double `start` is a no-op, a `stop`
//! before any `start` is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{Counters, CountersSnapshot, Event};
use crate::external::{BypassPath, ConnectionTableReader, PersistenceSource, ProtectSocket, TunProvider};
use crate::manager::{TunnelClientFactory, TunnelConnectionManager};
use crate::router::{AppRegistry, PacketRouter};
use crate::rules::{RuleCache, RuleCacheSnapshot, TunnelId};
use crate::tracker::ConnectionTracker;

/// Point-in-time read of the engine's overall health, for a status page
/// or a liveness probe. Never blocks on tunnel I/O.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub running: bool,
    pub tunnels_up: usize,
    pub counters: CountersSnapshot,
}

/// Safety-net poll interval for sources that can't push change
/// notifications (the default [`PersistenceSource::subscribe_changes`]
/// never ticks). A source that does push notifications reconciles on
/// the notification instead, well inside the required 1s propagation
/// bound; this interval only bounds staleness for a source that can't.
const RECONCILE_FALLBACK_INTERVAL: Duration = Duration::from_secs(10);
const TRACKER_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// `'static` bundle of the shared handles every background loop needs.
/// Kept separate from `VpnEngine` so a spawned task can own a cheap
/// clone of it instead of borrowing the engine across an arbitrarily
/// long-lived task.
struct Shared {
    tracker: Arc<ConnectionTracker>,
    apps: Arc<AppRegistry>,
    rule_cache: Arc<RuleCache>,
    manager: Arc<TunnelConnectionManager>,
    router: Arc<PacketRouter>,
    counters: Arc<Counters>,
    connection_table: Arc<dyn ConnectionTableReader>,
    persistence: Arc<dyn PersistenceSource>,
    tun: Arc<dyn TunProvider>,
    events_tx: broadcast::Sender<Event>,
}

impl Shared {
    /// For every persisted rule, resolves its app_package's owner
    /// identity ahead of any traffic and seeds a wildcard tracker entry,
    /// so the rule applies from the first packet rather than waiting for
    /// the periodic bulk refresh to observe a live connection.
    /// Best-effort: a package the host can't resolve yet (app not
    /// running) is simply left for the bulk refresh to pick up once it
    /// starts talking.
    fn register_rule_owners(&self, rules: &[crate::rules::Rule]) {
        for rule in rules {
            if let Some((app_id, addr)) = self.connection_table.resolve_app(&rule.app_package) {
                self.tracker.register_wildcard(addr, app_id);
            }
        }
    }

    fn refresh_tracker_once(&self) {
        let rows = self.connection_table.read_table();
        let mut packages = HashMap::with_capacity(rows.len());
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            packages.insert(row.app_id, row.app_package.clone());
            entries.push((row.proto, row.local_addr, row.local_port, row.app_id));
        }
        self.apps.replace(packages);
        self.tracker.bulk_refresh(entries);
    }

    /// Loads the current rule set and configs, replaces the rule cache,
    /// then diffs live tunnels against the tunnels named by the rule
    /// set: anything newly named gets `bring_up`; anything live but no
    /// longer named gets `tear_down`. Tunnels untouched by the diff keep
    /// their existing connection rather than reconnecting for free. A
    /// config with no rule pointing at it is loaded into the cache but
    /// never brought up; a rule pointing at a tunnel with no config is
    /// unresolvable and skipped, same as `wanted` just not containing it.
    async fn reconcile_once(&self) {
        let rules = self.persistence.load_rules();
        let configs = self.persistence.load_configs();
        self.rule_cache.replace(RuleCacheSnapshot::build(&rules, &configs));
        self.register_rule_owners(&rules);

        let wanted: HashSet<TunnelId> = rules
            .iter()
            .map(|rule| rule.tunnel_id)
            .filter(|tunnel_id| configs.contains_key(tunnel_id))
            .collect();
        let live: HashSet<TunnelId> = self.manager.live_tunnel_ids().await.into_iter().collect();

        let mut brought_up = 0usize;
        for tunnel_id in wanted.difference(&live) {
            let Some(vpn_config) = configs.get(tunnel_id) else {
                continue;
            };
            let Some(credentials) = self.persistence.resolve_credentials(&vpn_config.auth_material_ref) else {
                warn!(?tunnel_id, "no credentials resolved for tunnel, skipping bring-up");
                continue;
            };
            match self.manager.bring_up(vpn_config, credentials).await {
                Ok(()) => brought_up += 1,
                Err(e) => warn!(?tunnel_id, error = %e, "failed to bring up tunnel during reconciliation"),
            }
        }

        let mut torn_down = 0usize;
        for tunnel_id in live.difference(&wanted) {
            self.manager.tear_down(*tunnel_id).await;
            torn_down += 1;
        }

        if brought_up > 0 || torn_down > 0 {
            debug!(brought_up, torn_down, "rule reconciliation applied changes");
            let _ = self.events_tx.send(Event::RuleSetReconciled {
                tunnels_up: brought_up,
                tunnels_torn_down: torn_down,
            });
        }
    }
}

pub struct VpnEngine {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Spawned once at construction, not per `start()`: the inbound
    /// channel it drains can only be moved once. Lives for as long as
    /// the engine value does, independent of `start`/`stop` cycles, and
    /// is aborted on `Drop` rather than `stop()` — it holds the same
    /// `Arc<Shared>` that keeps its own sender half alive, so the
    /// channel closing on its own would never happen.
    inbound_pump: JoinHandle<()>,
}

impl Drop for VpnEngine {
    fn drop(&mut self) {
        self.inbound_pump.abort();
    }
}

impl VpnEngine {
    pub fn new(
        config: Config,
        protect: Arc<dyn ProtectSocket>,
        factory: Arc<dyn TunnelClientFactory>,
        persistence: Arc<dyn PersistenceSource>,
        connection_table: Arc<dyn ConnectionTableReader>,
        tun: Arc<dyn TunProvider>,
        bypass: Arc<dyn BypassPath>,
    ) -> Self {
        let tracker = Arc::new(ConnectionTracker::new(
            config.tracker_idle_timeout,
            config.tracker_soft_cap,
        ));
        let apps = Arc::new(AppRegistry::new());
        let rule_cache = Arc::new(RuleCache::new());
        let counters = Arc::new(Counters::new());
        let (events_tx, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_channel_depth);

        let manager = Arc::new(TunnelConnectionManager::new(
            protect,
            factory,
            config,
            counters.clone(),
            events_tx.clone(),
            inbound_tx,
        ));
        let router = Arc::new(PacketRouter::new(
            tracker.clone(),
            apps.clone(),
            rule_cache.clone(),
            manager.clone(),
            bypass,
            counters.clone(),
        ));

        let shared = Arc::new(Shared {
            tracker,
            apps,
            rule_cache,
            manager,
            router,
            counters,
            connection_table,
            persistence,
            tun,
            events_tx,
        });

        let inbound_pump = spawn_inbound_pump(shared.clone(), inbound_rx);
        Self {
            shared,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            inbound_pump,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.shared.events_tx.subscribe()
    }

    /// Brings the engine fully up: loads rules/configs, brings up every
    /// named tunnel, seeds the tracker, and starts the outbound pump and
    /// the periodic reconciliation loops. A second `start` while already
    /// running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.reconcile_once().await;
        self.shared.refresh_tracker_once();

        let mut tasks = self.tasks.lock().await;
        tasks.push(spawn_outbound_pump(self.shared.clone(), self.running.clone()));
        tasks.push(spawn_reconcile_loop(self.shared.clone(), self.running.clone()));
        tasks.push(spawn_tracker_refresh_loop(self.shared.clone(), self.running.clone()));

        info!("vpn engine started");
    }

    /// Idempotent: stopping an engine that isn't running is a no-op.
    /// Tears down every live tunnel and aborts the pump/reconcile tasks.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        for tunnel_id in self.shared.manager.live_tunnel_ids().await {
            self.shared.manager.tear_down(tunnel_id).await;
        }

        info!("vpn engine stopped");
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            running: self.running.load(Ordering::SeqCst),
            tunnels_up: self.shared.manager.live_tunnel_ids().await.len(),
            counters: self.shared.counters.snapshot(),
        }
    }
}

fn spawn_outbound_pump(shared: Arc<Shared>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while running.load(Ordering::SeqCst) {
            match shared.tun.read_packet(&mut buf).await {
                Ok(0) => continue,
                Ok(n) => {
                    shared.router.route(&buf[..n]).await;
                }
                Err(e) => {
                    warn!(error = %e, "tun read failed, pausing outbound pump briefly");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

fn spawn_inbound_pump(shared: Arc<Shared>, mut inbound_rx: mpsc::Receiver<(TunnelId, Vec<u8>)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((_tunnel_id, packet)) = inbound_rx.recv().await {
            if let Err(e) = shared.tun.write_packet(&packet).await {
                warn!(error = %e, "failed to write inbound packet back to tun");
            }
        }
    })
}

/// Reconciles on whichever comes first: a persistence change
/// notification (the common case — propagates within the required 1s
/// bound) or the slow fallback poll (the safety net for a source that
/// never notifies). `start()` already ran one reconciliation, so both
/// the interval and the watch channel's initial value are skipped here.
fn spawn_reconcile_loop(shared: Arc<Shared>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = shared.persistence.subscribe_changes();
        let mut interval = tokio::time::interval(RECONCILE_FALLBACK_INTERVAL);
        interval.tick().await;
        while running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                result = changes.changed() => {
                    if result.is_err() {
                        // Sender dropped: this source will never notify
                        // again, fall back to polling only.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                }
            }
            shared.reconcile_once().await;
        }
    })
}

fn spawn_tracker_refresh_loop(shared: Arc<Shared>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TRACKER_REFRESH_INTERVAL);
        interval.tick().await;
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            shared.refresh_tracker_once();
        }
    })
}
