//! Protocol-layer collaborators beyond the SIP wire format itself.
//!
//! spec.md scopes the RTP relay as a coordination/classification hook
//! only ("no media transport", "no codec handling") — the actual media
//! transport, SIP message parsing, and other protocol families the
//! teacher's gateway carried (PRI, SIGTRAN, DTMF, TR-069) have no
//! counterpart in this spec and are not part of this crate.

pub mod rtp;

pub use rtp::{RelayPorts, RtpProxyHook};
