//! RTP proxy hook: decides whether a call's media needs relaying and
//! rewrites SDP to point at the relay's allocated port pair.
//!
//! Grounded on `proxy::classify`/`proxy::assign`/`proxy::copy` in
//! `original_source/server/server.h`. The original `proxy` class also ran
//! the actual relay thread that shuffled RTP packets between endpoints;
//! that part is explicitly out of scope here (spec.md §1 Non-goals: "no
//! codec handling; no media transport") — this hook only classifies and
//! rewrites, leaving packet forwarding to whatever external relay the
//! deployment wires in.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::config::RtpConfig;

/// One call leg's allocated RTP/RTCP port pair on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPorts {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Classifies media-relay need and hands out port pairs from the
/// configured range. Deliberately stateless beyond the next-port cursor:
/// it does not track which ports belong to which call, matching the
/// spec's "classification hook", not a relay implementation.
pub struct RtpProxyHook {
    enabled: bool,
    port_min: u16,
    port_max: u16,
    next_port: AtomicU16,
}

impl RtpProxyHook {
    pub fn new(config: &RtpConfig) -> Self {
        Self {
            enabled: config.enabled,
            port_min: config.port_min,
            port_max: config.port_max,
            next_port: AtomicU16::new(config.port_min),
        }
    }

    pub fn is_required(&self) -> bool {
        self.enabled
    }

    /// `proxy::classify` — true if `source` and `target` are far enough
    /// apart topologically (different /24s, or v4 vs v6) that direct RTP
    /// between them can't be assumed and a relay should rewrite the path.
    pub fn classify(&self, source: SocketAddr, target: SocketAddr) -> bool {
        if !self.enabled {
            return false;
        }
        !same_network_class(source.ip(), target.ip())
    }

    /// `proxy::assign` — allocate the next port pair in the configured
    /// range, wrapping back to `port_min` once the range is exhausted.
    /// Returns `None` if relaying is disabled or the range can't hold a
    /// pair.
    pub fn assign(&self) -> Option<RelayPorts> {
        if !self.enabled || self.port_min.saturating_add(2) >= self.port_max {
            return None;
        }
        let mut port = self.next_port.load(Ordering::SeqCst);
        if port < self.port_min || port.saturating_add(1) >= self.port_max {
            port = self.port_min;
        }
        let next = if port.saturating_add(2) >= self.port_max {
            self.port_min
        } else {
            port + 2
        };
        self.next_port.store(next, Ordering::SeqCst);
        Some(RelayPorts { rtp: port, rtcp: port + 1 })
    }

    /// `proxy::copy` — rewrite a session's SDP so its connection and
    /// audio media lines point at the relay instead of the original
    /// endpoint, per spec.md §3's segment "media-classifier fields".
    pub fn rewrite_sdp(&self, sdp: &str, relay_addr: IpAddr, ports: RelayPorts) -> String {
        sdp.lines()
            .map(|line| {
                if line.starts_with("c=IN IP4") || line.starts_with("c=IN IP6") {
                    format!("c=IN {} {relay_addr}", ip_family_tag(relay_addr))
                } else if line.starts_with("m=audio ") {
                    let mut parts = line.splitn(3, ' ');
                    let tag = parts.next().unwrap_or("m=audio");
                    let _old_port = parts.next();
                    let remainder = parts.next().unwrap_or("RTP/AVP 0");
                    format!("{tag} {} {remainder}", ports.rtp)
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

fn ip_family_tag(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

fn same_network_class(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_config(enabled: bool) -> RtpConfig {
        RtpConfig {
            enabled,
            port_min: 10_000,
            port_max: 10_010,
        }
    }

    #[test]
    fn disabled_hook_never_classifies_as_required() {
        let hook = RtpProxyHook::new(&rtp_config(false));
        let a: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        let b: SocketAddr = "203.0.113.1:5060".parse().unwrap();
        assert!(!hook.classify(a, b));
        assert!(hook.assign().is_none());
    }

    #[test]
    fn classifies_cross_network_pairs_as_requiring_relay() {
        let hook = RtpProxyHook::new(&rtp_config(true));
        let local: SocketAddr = "10.0.0.5:5060".parse().unwrap();
        let external: SocketAddr = "203.0.113.7:5060".parse().unwrap();
        assert!(hook.classify(local, external));
    }

    #[test]
    fn same_subnet_pair_does_not_require_relay() {
        let hook = RtpProxyHook::new(&rtp_config(true));
        let a: SocketAddr = "10.0.0.5:5060".parse().unwrap();
        let b: SocketAddr = "10.0.0.6:5060".parse().unwrap();
        assert!(!hook.classify(a, b));
    }

    #[test]
    fn assign_cycles_through_port_range() {
        let hook = RtpProxyHook::new(&rtp_config(true));
        let first = hook.assign().unwrap();
        let second = hook.assign().unwrap();
        assert_eq!(first.rtp, 10_000);
        assert_eq!(first.rtcp, 10_001);
        assert_eq!(second.rtp, 10_002);
    }

    #[test]
    fn rewrite_sdp_replaces_connection_and_audio_port() {
        let hook = RtpProxyHook::new(&rtp_config(true));
        let sdp = "v=0\r\no=- 1 1 IN IP4 10.0.0.5\r\nc=IN IP4 10.0.0.5\r\nm=audio 30000 RTP/AVP 0\r\n";
        let relay_ip: IpAddr = "198.51.100.10".parse().unwrap();
        let rewritten = hook.rewrite_sdp(sdp, relay_ip, RelayPorts { rtp: 40000, rtcp: 40001 });
        assert!(rewritten.contains("c=IN IP4 198.51.100.10"));
        assert!(rewritten.contains("m=audio 40000 RTP/AVP 0"));
    }
}
