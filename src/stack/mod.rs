//! The call/session object graph: every in-flight dialog, the
//! transaction→session lookup index, and the timer queue that drives
//! ring/CFNA/reset/invite-expiry deadlines.
//!
//! Grounded on `stack::create`/`stack::find`/`stack::destroy` in
//! `original_source/server/server.h`, reworked onto the same
//! `Arena` + `DashMap` + single `RwLock` shape as [`crate::registry`].

pub mod call;
pub mod segment;
pub mod timer;

pub use call::{
    CancelTarget, Call, CallCounters, CallInner, CallKind, CallMode, CallState, ForwardingCause,
};
pub use segment::{Segment, SegmentState};
pub use timer::{TimerEntry, TimerKind, TimerQueue};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::arena::{Arena, Handle};
use crate::config::StackConfig;
use crate::error::Error;
use crate::Result;

pub type CallHandle = Handle<Call>;

/// What a CFNA/no-answer resolver decided for a call whose ring/cfna
/// timer just fired: forward to `contacts`, or (if empty) let the call
/// fall through to BUSY/FAILED.
pub struct ForwardDecision {
    pub to_userid: String,
    pub contacts: Vec<(String, SocketAddr)>,
}

/// A forked INVITE the worker still needs to actually send over the
/// transport, produced by [`Stack::sweep_with_forwarding`].
pub struct PendingInvite {
    pub call_handle: CallHandle,
    pub leg_cid: String,
    pub contact: String,
    pub destination: SocketAddr,
}

struct Inner {
    calls: Arena<Call>,
    /// Maps a leg's wire-level Call-ID to the owning call + segment index.
    cid_index: DashMap<String, (CallHandle, usize)>,
}

pub struct Stack {
    inner: RwLock<Inner>,
    pub timers: TimerQueue,
    config: StackConfig,
    next_id: AtomicI64,
    /// Monotonic count of every segment ever created (source or forked
    /// leg), regardless of whether the owning call has since been
    /// destroyed — the session analogue of `Arena::allocated_count`.
    segment_allocations: AtomicUsize,
}

impl Stack {
    pub fn new(config: StackConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                calls: Arena::new(config.max_calls),
                cid_index: DashMap::new(),
            }),
            timers: TimerQueue::new(),
            config,
            next_id: AtomicI64::new(1),
            segment_allocations: AtomicUsize::new(0),
        }
    }

    /// `stack::create(cid)` — allocate a call, create its source session,
    /// arm the INITIAL safety-net timer, and index the leg by cid.
    pub fn create(
        &self,
        cid: &str,
        kind: CallKind,
        from: &str,
        identity: &str,
        source_addr: SocketAddr,
    ) -> Result<CallHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let source = Segment::new(cid, from, identity);
        let call = Call::new(
            id,
            kind,
            source,
            self.config.initial_timeout_ms as i64 / 1000,
            source_addr,
        );

        let mut inner = self.inner.write().unwrap();
        let handle = inner.calls.allocate(call)?;
        inner.cid_index.insert(cid.to_string(), (handle, 0));
        drop(inner);
        self.segment_allocations.fetch_add(1, Ordering::Relaxed);

        self.timers
            .arm(id, TimerKind::InitialSafety, self.config.initial_timeout_ms);
        info!(call_id = id, cid, "stack: call created");
        Ok(handle)
    }

    pub fn find_by_cid(&self, cid: &str) -> Option<(CallHandle, usize)> {
        let inner = self.inner.read().unwrap();
        inner.cid_index.get(cid).map(|e| *e)
    }

    pub fn index_segment(&self, cid: &str, handle: CallHandle, segment_index: usize) {
        let inner = self.inner.read().unwrap();
        inner.cid_index.insert(cid.to_string(), (handle, segment_index));
    }

    pub fn with_call<R>(&self, handle: CallHandle, f: impl FnOnce(&Call) -> R) -> Option<R> {
        let inner = self.inner.read().unwrap();
        inner.calls.get(handle).map(f)
    }

    pub fn arm_ring_timer(&self, call_id: i64) {
        self.timers.arm(call_id, TimerKind::Ring, self.config.ring_timer_ms);
    }

    pub fn arm_cfna_timer(&self, call_id: i64) {
        self.timers.arm(call_id, TimerKind::Cfna, self.config.cfna_timer_ms);
    }

    pub fn arm_reset_timer(&self, call_id: i64) {
        self.timers.arm(call_id, TimerKind::Reset, self.config.reset_timer_ms);
    }

    pub fn arm_invite_expires(&self, call_id: i64) {
        self.timers
            .arm(call_id, TimerKind::InviteExpires, self.config.invite_expires_s * 1000);
    }

    /// `stack::destroy(cid)` — FINAL state reached: drop every cid index
    /// entry for the call's segments and return the slot to the arena.
    pub fn destroy(&self, handle: CallHandle) {
        let mut inner = self.inner.write().unwrap();
        let cids: Vec<String> = inner
            .calls
            .get(handle)
            .map(|c| c.with_inner(|ci| ci.segments.iter().map(|s| s.cid.clone()).collect()))
            .unwrap_or_default();
        for cid in cids {
            inner.cid_index.remove(&cid);
        }
        inner.calls.destroy(handle);
    }

    /// Called from the background thread: pop every due timer and apply
    /// the corresponding transition, then garbage-collect FINAL calls.
    /// Ring/Cfna timeouts fall straight through to BUSY — callers that
    /// want CFNA forwarding should use [`Stack::sweep_with_forwarding`].
    pub fn sweep(&self) -> usize {
        let mut acted = 0;
        let due = self.timers.drain_due();
        for entry in &due {
            self.apply_timer(entry, &mut |_, _| None, &mut Vec::new());
            acted += 1;
        }
        self.collect_final();
        acted
    }

    pub fn find_by_call_id(&self, call_id: i64) -> Option<CallHandle> {
        let inner = self.inner.read().unwrap();
        inner.calls.iter().find(|(_, c)| c.id == call_id).map(|(h, _)| h)
    }

    /// Pop every due timer, letting `resolve` decide (by consulting the
    /// registry) whether a Ring/Cfna timeout should be forwarded instead
    /// of ending the call in BUSY. Returns the forked legs the caller
    /// still needs to actually send an INVITE for.
    pub fn sweep_with_forwarding(
        &self,
        mut resolve: impl FnMut(&Call, TimerKind) -> Option<ForwardDecision>,
    ) -> Vec<PendingInvite> {
        let due = self.timers.drain_due();
        let mut pending = Vec::new();
        for entry in &due {
            self.apply_timer(entry, &mut |call, kind| resolve(call, kind), &mut pending);
        }
        self.collect_final();
        pending
    }

    fn apply_timer(
        &self,
        entry: &TimerEntry,
        resolve: &mut impl FnMut(&Call, TimerKind) -> Option<ForwardDecision>,
        pending: &mut Vec<PendingInvite>,
    ) {
        let Some(handle) = self.find_by_call_id(entry.call_id) else { return };
        match entry.kind {
            TimerKind::InitialSafety => {
                if self.with_call(handle, |c| c.is_past_safety_net()).unwrap_or(false) {
                    warn!(call_id = entry.call_id, "call GC'd: never left INITIAL");
                    self.with_call(handle, |c| c.terminate("initial timeout"));
                    self.arm_reset_timer(entry.call_id);
                }
            }
            TimerKind::Ring | TimerKind::Cfna => {
                let decision = self.with_call(handle, |c| resolve(c, entry.kind)).flatten();
                match decision {
                    Some(d) if !d.contacts.is_empty() => {
                        let from = self.with_call(handle, |c| c.source_from()).unwrap_or_default();
                        for (n, (contact, destination)) in d.contacts.iter().enumerate() {
                            let leg_cid = format!("{}-fwd-{}-{}", entry.call_id, d.to_userid, n);
                            let idx = self
                                .with_call(handle, |c| {
                                    c.add_segment(
                                        Segment::new(&leg_cid, &from, &d.to_userid)
                                            .with_destination(*destination, contact),
                                    )
                                })
                                .unwrap_or(0);
                            self.index_segment(&leg_cid, handle, idx);
                            self.segment_allocations.fetch_add(1, Ordering::Relaxed);
                            self.with_call(handle, |c| c.segment_ringing(idx).ok());
                            pending.push(PendingInvite {
                                call_handle: handle,
                                leg_cid,
                                contact: contact.clone(),
                                destination: *destination,
                            });
                        }
                        self.arm_ring_timer(entry.call_id);
                    }
                    _ => {
                        self.with_call(handle, |c| c.all_busy().ok());
                        self.arm_reset_timer(entry.call_id);
                    }
                }
            }
            TimerKind::Reset => {
                self.with_call(handle, |c| c.finalize());
            }
            TimerKind::InviteExpires => {
                self.with_call(handle, |c| c.terminate("invite-expires"));
                self.arm_reset_timer(entry.call_id);
            }
        }
    }

    fn collect_final(&self) {
        let finals: Vec<CallHandle> = {
            let inner = self.inner.read().unwrap();
            inner
                .calls
                .iter()
                .filter(|(_, c)| c.state() == CallState::Final)
                .map(|(h, _)| h)
                .collect()
        };
        for handle in finals {
            self.destroy(handle);
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.inner.read().unwrap().calls.live_count()
    }

    pub fn active_session_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .calls
            .iter()
            .map(|(_, c)| c.live_segment_count())
            .sum()
    }

    pub fn allocated_call_count(&self) -> usize {
        self.inner.read().unwrap().calls.allocated_count()
    }

    /// Record a segment allocated by a caller outside this module (the
    /// worker's fork loop) so it counts toward [`Stack::allocated_session_count`].
    pub fn note_segment_allocated(&self) {
        self.segment_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocated_session_count(&self) -> usize {
        self.segment_allocations.load(Ordering::Relaxed)
    }

    pub fn mapped_calls(&self) -> usize {
        self.config.max_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;

    fn stack() -> Stack {
        Stack::new(PbxConfig::default_config().stack)
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:5060".parse().unwrap()
    }

    #[test]
    fn create_indexes_source_segment_by_cid() {
        let s = stack();
        let h = s.create("call-1", CallKind::Incoming, "sip:a@x", "101", addr()).unwrap();
        let (found, idx) = s.find_by_cid("call-1").unwrap();
        assert_eq!(found, h);
        assert_eq!(idx, 0);
    }

    #[test]
    fn safety_net_timer_terminates_idle_call() {
        let mut cfg = PbxConfig::default_config().stack;
        cfg.initial_timeout_ms = 0;
        let s = Stack::new(cfg);
        let h = s.create("call-1", CallKind::Incoming, "sip:a@x", "101", addr()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.sweep();
        assert_eq!(s.with_call(h, |c| c.state()), Some(CallState::Terminate));
    }

    #[test]
    fn capacity_exhausted_rejects_new_calls() {
        let mut cfg = PbxConfig::default_config().stack;
        cfg.max_calls = 1;
        let s = Stack::new(cfg);
        s.create("call-1", CallKind::Incoming, "sip:a@x", "101", addr()).unwrap();
        assert!(matches!(
            s.create("call-2", CallKind::Incoming, "sip:a@x", "101", addr()),
            Err(Error::Capacity(_))
        ));
    }

    #[test]
    fn destroy_removes_all_segment_cid_entries() {
        let s = stack();
        let h = s.create("call-1", CallKind::Incoming, "sip:a@x", "101", addr()).unwrap();
        s.with_call(h, |c| c.add_segment(Segment::new("call-1-b", "sip:a@x", "102")));
        s.index_segment("call-1-b", h, 1);
        s.destroy(h);
        assert!(s.find_by_cid("call-1").is_none());
        assert!(s.find_by_cid("call-1-b").is_none());
    }
}
