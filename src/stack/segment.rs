//! One dialog leg of a call — one INVITE sent to one candidate target.
//!
//! Grounded on `session`/`Segment` in `original_source/server/server.h`.

use std::net::SocketAddr;

use crate::registry::RegistryHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
    Ring,
    Busy,
    Reorder,
    Refer,
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// SIP Call-ID of this leg, as seen on the wire.
    pub cid: String,
    /// Transaction id of the outstanding request, if any.
    pub tid: Option<String>,
    /// Dialog id (local-tag/remote-tag pair), once established.
    pub did: Option<String>,
    /// Back-reference into the registry, if this leg targets a
    /// provisioned user rather than an external URI.
    pub reg: Option<RegistryHandle>,
    pub state: SegmentState,
    pub iface: String,
    pub expires: i64,
    pub ringing: bool,
    pub sdp: Option<String>,
    pub identity: String,
    pub sysident: String,
    pub display: Option<String>,
    pub from: String,
    pub authid: String,
    pub secret: String,
    pub authtype: String,
    /// Set once the worker has rewritten SDP for a media relay; purely
    /// advisory, the relay itself is out of scope.
    pub media_classified: bool,
    /// Network address the outbound INVITE for this leg was sent to, so a
    /// later CANCEL or response can be routed without a fresh lookup.
    pub destination: Option<SocketAddr>,
    /// Request-URI used for the outbound INVITE, echoed on CANCEL.
    pub request_uri: String,
}

impl Segment {
    pub fn new(cid: &str, from: &str, identity: &str) -> Self {
        Self {
            cid: cid.to_string(),
            tid: None,
            did: None,
            reg: None,
            state: SegmentState::Open,
            iface: String::new(),
            expires: 0,
            ringing: false,
            sdp: None,
            identity: identity.to_string(),
            sysident: String::new(),
            display: None,
            from: from.to_string(),
            authid: String::new(),
            secret: String::new(),
            authtype: String::new(),
            media_classified: false,
            destination: None,
            request_uri: String::new(),
        }
    }

    pub fn with_destination(mut self, destination: SocketAddr, request_uri: &str) -> Self {
        self.destination = Some(destination);
        self.request_uri = request_uri.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_segment_starts_open_with_no_dialog() {
        let seg = Segment::new("call-1", "sip:alice@x", "101");
        assert_eq!(seg.state, SegmentState::Open);
        assert!(seg.did.is_none());
    }
}
