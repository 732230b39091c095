//! Manual test harness for the VPN router core.
//!
//! Wires the engine up against the in-memory C9 stand-ins (no real OS
//! TUN capture, connection table, or persistence store) so the router,
//! tunnel manager, and reconciliation loop can be exercised end to end
//! from a terminal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpn_core::config::Config;
use vpn_core::engine::VpnEngine;
use vpn_core::external::tests::{AllowAllProtect, ChannelBypass, ChannelTun, InMemoryPersistence, StaticConnectionTable};
use vpn_core::external::ConnectionTableRow;
use vpn_core::manager::TunnelClientFactory;
use vpn_core::packet::Proto;
use vpn_core::rules::{AppId, Rule, TunnelId, TunnelProtocol, VpnConfig};
use vpn_core::tunnel::legacy::test_support::LoopbackLegacyLibrary;
use vpn_core::tunnel::legacy::LegacyLibrary;
use vpn_core::tunnel::Credentials;

#[derive(Parser)]
#[command(name = "vpn-cli")]
#[command(about = "Manual test harness for the VPN router core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Brings up a demo legacy tunnel behind one routed app, runs for a
    /// fixed duration while printing periodic health snapshots, then
    /// tears everything down.
    Demo {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

struct DemoFactory;

impl TunnelClientFactory for DemoFactory {
    fn legacy_library(&self) -> Arc<dyn LegacyLibrary> {
        Arc::new(LoopbackLegacyLibrary { mtu_option: None })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vpn_core=debug".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { seconds } => run_demo(seconds).await?,
    }

    Ok(())
}

async fn run_demo(seconds: u64) -> anyhow::Result<()> {
    let tunnel_id = TunnelId(1);
    let app_id = AppId(1);
    let app_package = "com.example.routed-app";

    let vpn_config = VpnConfig {
        tunnel_id,
        protocol: TunnelProtocol::Legacy,
        config_blob: "client\nremote vpn.example.com 1194\nproto udp\n".to_string(),
        endpoint: "127.0.0.1:1194".parse::<SocketAddr>()?,
        auth_material_ref: "demo-ref".to_string(),
        dns_servers: None,
        allowed_ips: None,
    };

    let persistence = Arc::new(InMemoryPersistence::new(
        vec![Rule {
            app_package: app_package.to_string(),
            tunnel_id,
        }],
        HashMap::from([(tunnel_id, vpn_config)]),
    ));
    persistence.set_credential(
        "demo-ref",
        Credentials::UserPass {
            username: "demo".into(),
            password: "demo".into(),
        },
    );

    let connection_table = Arc::new(StaticConnectionTable::new(vec![ConnectionTableRow {
        proto: Proto::Udp,
        local_addr: "10.0.0.5".parse()?,
        local_port: 5353,
        app_id,
        app_package: app_package.to_string(),
    }]));

    let (tun, _feed_tx, mut inbound_rx) = ChannelTun::new();
    let (bypass, mut bypass_rx) = ChannelBypass::new(64);

    let engine = VpnEngine::new(
        Config::default(),
        Arc::new(AllowAllProtect),
        Arc::new(DemoFactory),
        persistence,
        connection_table,
        Arc::new(tun),
        Arc::new(bypass),
    );

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "engine event");
        }
    });
    // Drain both side channels so the demo doesn't block on a full
    // buffer: decrypted inbound packets written back to the captured
    // TUN, and outbound packets that took the bypass path instead.
    tokio::spawn(async move { while inbound_rx.recv().await.is_some() {} });
    tokio::spawn(async move { while bypass_rx.recv().await.is_some() {} });

    engine.start().await;
    println!("engine started, tunnel {app_package} -> {tunnel_id:?}");

    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let health = engine.health().await;
        println!(
            "health: running={} tunnels_up={} routed={} bypassed={}",
            health.running, health.tunnels_up, health.counters.routed, health.counters.bypassed
        );
    }

    engine.stop().await;
    println!("engine stopped");
    Ok(())
}
