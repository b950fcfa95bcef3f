//! One logical call and its state machine.
//!
//! Grounded on the `Call`/`MappedCall` state machine described in
//! `original_source/server/server.h` and `server/stack.cpp`'s transition
//! table. A [`Call`] owns its segments directly (no separate segment
//! arena) — matching the "calls own their segments" ownership note — and
//! guards every mutable field behind its own mutex so the registry/stack
//! structural locks never need to be held across a state transition.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use super::segment::{Segment, SegmentState};
use crate::error::{Error, RoutingFailure};
use crate::Result;

/// A forked leg dropped in favor of the winner, carrying what the worker
/// needs to emit a CANCEL for it.
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub cid: String,
    pub destination: Option<SocketAddr>,
    pub request_uri: String,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initial,
    Trying,
    Ringing,
    Ringback,
    Reorder,
    Holding,
    Answered,
    Joined,
    Transfer,
    Redirect,
    Busy,
    Terminate,
    Failed,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Directed,
    Circular,
    Terminal,
    Redirected,
    Distributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Local,
    Incoming,
    Outgoing,
    Refer,
}

/// Single active forwarding cause for this call, distinct from the
/// per-profile [`crate::registry::ForwardMask`] bitmask that decides
/// which causes a user has *enabled*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingCause {
    Ignore,
    Na,
    Busy,
    Dnd,
    Away,
    All,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CallCounters {
    pub count: u32,
    pub invited: u32,
    pub ringing: u32,
    pub ringbusy: u32,
    pub unreachable: u32,
}

pub struct CallInner {
    pub state: CallState,
    pub mode: CallMode,
    pub kind: CallKind,
    pub counters: CallCounters,
    /// Index into `segments` for the caller leg. Always 0: "the source
    /// session is always the first allocated for the call".
    pub source: usize,
    /// Index into `segments` for the currently selected callee leg.
    pub target: Option<usize>,
    /// Cursor used when forking sequentially (CIRCULAR/TERMINAL).
    pub select: usize,
    pub segments: Vec<Segment>,
    pub forwarding: ForwardingCause,
    /// Chain of userids this call has already been forwarded through,
    /// preventing forwarding loops (S3).
    pub refer_chain: Vec<String>,
    pub expires: i64,
    pub starting: i64,
    pub ending: Option<i64>,
    pub reason: Option<String>,
    pub rtp: Option<()>,
    /// Where to deliver replies/forwarded requests bound for the caller
    /// leg, captured at call creation since the caller may not have an
    /// open transaction at the moment a forked response arrives.
    pub source_addr: SocketAddr,
}

pub struct Call {
    pub id: i64,
    inner: Mutex<CallInner>,
}

impl Call {
    pub fn new(
        id: i64,
        kind: CallKind,
        source: Segment,
        safety_net_s: i64,
        source_addr: SocketAddr,
    ) -> Self {
        let t = now();
        Self {
            id,
            inner: Mutex::new(CallInner {
                state: CallState::Initial,
                mode: CallMode::Directed,
                kind,
                counters: CallCounters {
                    count: 1,
                    ..Default::default()
                },
                source: 0,
                target: None,
                select: 0,
                segments: vec![source],
                forwarding: ForwardingCause::Ignore,
                refer_chain: Vec::new(),
                expires: t + safety_net_s,
                starting: t,
                ending: None,
                reason: None,
                rtp: None,
                source_addr,
            }),
        }
    }

    pub fn with_inner<R>(&self, f: impl FnOnce(&CallInner) -> R) -> R {
        f(&self.inner.lock().expect("call mutex poisoned"))
    }

    pub fn with_inner_mut<R>(&self, f: impl FnOnce(&mut CallInner) -> R) -> R {
        f(&mut self.inner.lock().expect("call mutex poisoned"))
    }

    pub fn state(&self) -> CallState {
        self.with_inner(|c| c.state)
    }

    pub fn live_segment_count(&self) -> usize {
        self.with_inner(|c| {
            c.segments
                .iter()
                .filter(|s| s.state != SegmentState::Closed)
                .count()
        })
    }

    /// Add a forked leg (segment) to this call, per the DIRECTED/CIRCULAR/
    /// TERMINAL/DISTRIBUTED fork modes.
    pub fn add_segment(&self, segment: Segment) -> usize {
        self.with_inner_mut(|c| {
            c.segments.push(segment);
            c.counters.invited += 1;
            c.segments.len() - 1
        })
    }

    /// INITIAL --INVITE valid--> TRYING.
    pub fn begin_trying(&self) -> Result<()> {
        self.with_inner_mut(|c| {
            if c.state != CallState::Initial {
                return Err(Error::invalid_state(format!(
                    "begin_trying from {:?}",
                    c.state
                )));
            }
            c.state = CallState::Trying;
            Ok(())
        })
    }

    /// TRYING --target rings--> RINGING.
    pub fn segment_ringing(&self, index: usize) -> Result<()> {
        self.with_inner_mut(|c| {
            if c.state != CallState::Trying && c.state != CallState::Ringing {
                return Err(Error::invalid_state(format!(
                    "segment_ringing from {:?}",
                    c.state
                )));
            }
            if let Some(seg) = c.segments.get_mut(index) {
                seg.state = SegmentState::Ring;
                seg.ringing = true;
            }
            c.counters.ringing += 1;
            c.state = CallState::Ringing;
            c.target = Some(index);
            Ok(())
        })
    }

    /// RINGING --180 from target--> RINGBACK.
    pub fn ringback(&self) -> Result<()> {
        self.with_inner_mut(|c| {
            if c.state != CallState::Ringing {
                return Err(Error::invalid_state("ringback requires RINGING"));
            }
            c.state = CallState::Ringback;
            Ok(())
        })
    }

    /// RINGING/RINGBACK --200 from target--> ANSWERED. All other segments
    /// are marked CLOSED ("strip other segments") and returned so the
    /// worker can CANCEL each one still outstanding (S6).
    pub fn answer(&self, winner: usize) -> Result<Vec<CancelTarget>> {
        self.with_inner_mut(|c| {
            if c.state != CallState::Ringing && c.state != CallState::Ringback {
                return Err(Error::invalid_state(format!(
                    "answer from {:?}",
                    c.state
                )));
            }
            let source = c.source;
            let mut cancels = Vec::new();
            for (i, seg) in c.segments.iter_mut().enumerate() {
                if i != winner && i != source {
                    if seg.state != SegmentState::Closed {
                        cancels.push(CancelTarget {
                            cid: seg.cid.clone(),
                            destination: seg.destination,
                            request_uri: seg.request_uri.clone(),
                        });
                    }
                    seg.state = SegmentState::Closed;
                }
            }
            c.target = Some(winner);
            c.state = CallState::Answered;
            Ok(cancels)
        })
    }

    /// Record that segment `index` failed — busy (486) or otherwise
    /// unreachable (404/480/etc). Returns `Some(true)` once every forked
    /// leg has failed and at least one was BUSY (spec: ends in BUSY),
    /// `Some(false)` once all failed with none BUSY (ends in FAILED), or
    /// `None` while segments are still outstanding.
    pub fn segment_failed(&self, index: usize, busy: bool) -> Option<bool> {
        self.with_inner_mut(|c| {
            if let Some(seg) = c.segments.get_mut(index) {
                seg.state = if busy {
                    SegmentState::Busy
                } else {
                    SegmentState::Closed
                };
            }
            if busy {
                c.counters.ringbusy += 1;
            } else {
                c.counters.unreachable += 1;
            }
            let resolved = c.counters.ringbusy + c.counters.unreachable;
            if resolved >= c.counters.invited {
                Some(c.counters.ringbusy > 0)
            } else {
                None
            }
        })
    }

    /// Userid of the leg currently selected as the callee, if any —
    /// consulted by CFNA forwarding to resolve the profile to forward
    /// from.
    pub fn target_userid(&self) -> Option<String> {
        self.with_inner(|c| c.target.and_then(|i| c.segments.get(i)).map(|s| s.identity.clone()))
    }

    pub fn source_addr(&self) -> SocketAddr {
        self.with_inner(|c| c.source_addr)
    }

    pub fn source_cid(&self) -> String {
        self.with_inner(|c| c.segments[c.source].cid.clone())
    }

    pub fn source_from(&self) -> String {
        self.with_inner(|c| c.segments[c.source].from.clone())
    }

    /// ANSWERED --ACK from source--> JOINED.
    pub fn join(&self) -> Result<()> {
        self.with_inner_mut(|c| {
            if c.state != CallState::Answered {
                return Err(Error::invalid_state("join requires ANSWERED"));
            }
            c.state = CallState::Joined;
            info!(call = self.id, "call joined");
            Ok(())
        })
    }

    /// All targets busy: TRYING/RINGING -> BUSY.
    pub fn all_busy(&self) -> Result<()> {
        self.with_inner_mut(|c| {
            c.state = CallState::Busy;
            Ok(())
        })
    }

    /// All targets unreachable: TRYING -> FAILED.
    pub fn unreachable(&self) -> Result<()> {
        self.with_inner_mut(|c| {
            c.state = CallState::Failed;
            c.reason = Some(RoutingFailure::Unreachable.to_string());
            Ok(())
        })
    }

    /// JOINED --BYE either leg--> TERMINATE, or CANCEL from any state.
    pub fn terminate(&self, reason: &str) {
        self.with_inner_mut(|c| {
            for seg in c.segments.iter_mut() {
                seg.state = SegmentState::Closed;
            }
            c.state = CallState::Terminate;
            c.ending = Some(now());
            c.reason = Some(reason.to_string());
            warn!(call = self.id, reason, "call terminating");
        });
    }

    /// TERMINATE --timer--> FINAL.
    pub fn finalize(&self) {
        self.with_inner_mut(|c| {
            c.state = CallState::Final;
        });
    }

    /// Apply a forwarding cause, recording the forwarded-from userid to
    /// the refer chain so a later CFNA/CFB cannot loop back to it.
    pub fn apply_forwarding(&self, cause: ForwardingCause, from_userid: &str) -> bool {
        self.with_inner_mut(|c| {
            if c.refer_chain.iter().any(|u| u == from_userid) {
                return false;
            }
            c.forwarding = cause;
            c.refer_chain.push(from_userid.to_string());
            true
        })
    }

    pub fn is_past_safety_net(&self) -> bool {
        self.with_inner(|c| c.state == CallState::Initial && now() >= c.expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:5060".parse().unwrap()
    }

    fn call() -> Call {
        Call::new(1, CallKind::Incoming, Segment::new("c1", "sip:a@x", "101"), 7, addr())
    }

    #[test]
    fn happy_path_initial_to_joined() {
        let c = call();
        c.begin_trying().unwrap();
        let idx = c.add_segment(Segment::new("c1-b", "sip:a@x", "102"));
        c.segment_ringing(idx).unwrap();
        c.ringback().unwrap();
        c.answer(idx).unwrap();
        c.join().unwrap();
        assert_eq!(c.state(), CallState::Joined);
        assert_eq!(c.live_segment_count(), 2, "source leg and winning leg both stay live");
    }

    #[test]
    fn answer_returns_cancel_targets_for_losing_segments() {
        let c = call();
        c.begin_trying().unwrap();
        let a = c.add_segment(
            Segment::new("c1-a", "sip:a@x", "102").with_destination(addr(), "sip:t1@x"),
        );
        let b = c.add_segment(
            Segment::new("c1-b", "sip:a@x", "102").with_destination(addr(), "sip:t2@x"),
        );
        c.segment_ringing(a).unwrap();
        let cancels = c.answer(b).unwrap();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].cid, "c1-a");
    }

    #[test]
    fn segment_failed_resolves_busy_over_unreachable() {
        let c = call();
        c.begin_trying().unwrap();
        let a = c.add_segment(Segment::new("c1-a", "sip:a@x", "102"));
        let b = c.add_segment(Segment::new("c1-b", "sip:a@x", "102"));
        assert_eq!(c.segment_failed(a, false), None);
        assert_eq!(c.segment_failed(b, true), Some(true));
    }

    #[test]
    fn busy_path_rejects_join() {
        let c = call();
        c.begin_trying().unwrap();
        c.all_busy().unwrap();
        assert!(c.join().is_err());
    }

    #[test]
    fn forwarding_loop_is_rejected_once_seen() {
        let c = call();
        assert!(c.apply_forwarding(ForwardingCause::Na, "102"));
        assert!(!c.apply_forwarding(ForwardingCause::Na, "102"));
    }

    #[test]
    fn safety_net_fires_only_while_initial() {
        let c = Call::new(2, CallKind::Incoming, Segment::new("c2", "sip:a@x", "101"), -1, addr());
        assert!(c.is_past_safety_net());
        c.begin_trying().unwrap();
        assert!(!c.is_past_safety_net());
    }
}
