//! Protocol detection, factored out of C6 so it is independently
//! unit-testable against the exact scenarios in the core's test plan.
//!
//! Detection runs on the textual config blob, before any client is
//! constructed. The rule is deliberately narrow — look only at whether
//! the (whitespace-trimmed) blob starts with `[Interface]` — so an
//! adversarial config can't be crafted to masquerade as the other
//! protocol via some cleverer heuristic.

use crate::rules::TunnelProtocol;

const MODERN_HEADER: &str = "[Interface]";

/// Detects whether `config_blob` is a modern (WireGuard-style INI) or
/// legacy (OpenVPN-style line-oriented) tunnel configuration.
pub fn detect_protocol(config_blob: &str) -> TunnelProtocol {
    if config_blob.trim_start().starts_with(MODERN_HEADER) {
        TunnelProtocol::Modern
    } else {
        TunnelProtocol::Legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_modern_from_bare_header() {
        let blob = "[Interface]\nAddress = 10.0.0.2/24\n";
        assert_eq!(detect_protocol(blob), TunnelProtocol::Modern);
    }

    #[test]
    fn detects_modern_with_leading_whitespace() {
        let blob = "  \n\t[Interface]\nAddress = 10.0.0.2/24\n";
        assert_eq!(detect_protocol(blob), TunnelProtocol::Modern);
    }

    #[test]
    fn detects_modern_with_trailing_edits() {
        let blob = "[Interface]\nAddress = 10.0.0.2/24\n\n\n   ";
        assert_eq!(detect_protocol(blob), TunnelProtocol::Modern);
    }

    #[test]
    fn detects_legacy_from_client_directive() {
        let blob = "client\nremote vpn.example.com 1194\nproto udp\n";
        assert_eq!(detect_protocol(blob), TunnelProtocol::Legacy);
    }

    #[test]
    fn does_not_guess_on_ambiguous_input() {
        // No [Interface] header anywhere: legacy by exclusion, not a guess.
        let blob = "remote 1.2.3.4 1194\n";
        assert_eq!(detect_protocol(blob), TunnelProtocol::Legacy);
    }
}
