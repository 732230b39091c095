//! Multi-tunnel, rules-based VPN router core.
//!
//! Classifies outbound packets by owning app, looks up that app's
//! per-app tunnel rule, and hands the packet to the matching tunnel
//! client — modern (WireGuard-style, connectionless) or legacy
//! (library-owned TUN, bridged via a socket pair) — while everything
//! without a matching rule bypasses the tunnel untouched.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod external;
pub mod manager;
pub mod packet;
pub mod protocol;
pub mod router;
pub mod rules;
pub mod tracker;
pub mod tunnel;
