//! End-to-end call scenarios driven directly against the registry/stack
//! pair, the same way a worker thread would, without a real transport —
//! this is the public-API surface `Worker`/`Engine` sit on top of.

use std::net::SocketAddr;

use sipwitch_pbx::config::PbxConfig;
use sipwitch_pbx::registry::{ForwardMask, Registry};
use sipwitch_pbx::stack::{CallKind, CallState, ForwardDecision, Segment, Stack, TimerKind};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn registry() -> Registry {
    Registry::new(PbxConfig::default_config().registry)
}

fn stack_with(max_calls: usize) -> Stack {
    let mut cfg = PbxConfig::default_config().stack;
    cfg.max_calls = max_calls;
    Stack::new(cfg)
}

/// S1 — Basic call: Alice INVITEs Bob, Bob answers, ACK joins the call.
#[test]
fn basic_call_reaches_joined_with_two_sessions() {
    let registry = registry();
    let stack = stack_with(0);

    let alice = registry.create("101").unwrap();
    registry.refresh(alice, addr("10.0.0.5:5060"), "sip:101@10.0.0.5", 300);
    let bob = registry.create("102").unwrap();
    registry.refresh(bob, addr("10.0.0.6:5060"), "sip:102@10.0.0.6", 300);

    let call = stack
        .create("call-1", CallKind::Incoming, "sip:101@10.0.0.5", "102", addr("10.0.0.5:5060"))
        .unwrap();
    stack.with_call(call, |c| c.begin_trying()).unwrap().unwrap();

    let bob_contact = registry
        .with_entry(bob, |e| e.ranked_targets()[0].contact.clone())
        .unwrap();
    let idx = stack
        .with_call(call, |c| c.add_segment(Segment::new("call-1-b", "sip:101@10.0.0.5", "102")))
        .unwrap();
    stack.with_call(call, |c| c.segment_ringing(idx)).unwrap().unwrap();
    stack.with_call(call, |c| c.ringback()).unwrap().unwrap();
    let cancels = stack.with_call(call, |c| c.answer(idx)).unwrap().unwrap();
    assert!(cancels.is_empty(), "single-target call should have nothing to cancel");
    stack.with_call(call, |c| c.join()).unwrap().unwrap();

    assert_eq!(stack.with_call(call, |c| c.state()), Some(CallState::Joined));
    assert_eq!(stack.active_call_count(), 1);
    assert_eq!(stack.active_session_count(), 2, "source + winning leg both still live");
    assert!(bob_contact.contains("10.0.0.6"));
}

/// S2 — Busy: Bob rejects with 486; the call ends in BUSY, then FINAL once
/// the reset timer fires.
#[test]
fn busy_response_ends_call_in_busy_then_final() {
    let mut cfg = PbxConfig::default_config().stack;
    cfg.reset_timer_ms = 0;
    let stack = Stack::new(cfg);

    let call = stack
        .create("call-2", CallKind::Incoming, "sip:101@10.0.0.5", "102", addr("10.0.0.5:5060"))
        .unwrap();
    stack.with_call(call, |c| c.begin_trying()).unwrap().unwrap();
    let idx = stack
        .with_call(call, |c| c.add_segment(Segment::new("call-2-b", "sip:101@10.0.0.5", "102")))
        .unwrap();
    stack.with_call(call, |c| c.segment_ringing(idx)).unwrap().unwrap();

    let resolved = stack.with_call(call, |c| c.segment_failed(idx, true)).unwrap();
    assert_eq!(resolved, Some(true), "single busy leg resolves the whole call to BUSY");
    stack.with_call(call, |c| c.all_busy()).unwrap().unwrap();
    assert_eq!(stack.with_call(call, |c| c.state()), Some(CallState::Busy));

    stack.arm_reset_timer(stack.with_call(call, |c| c.id).unwrap());
    std::thread::sleep(std::time::Duration::from_millis(5));
    stack.sweep();
    assert!(stack.find_by_call_id(1).is_none() || stack.active_call_count() == 0);
}

/// S3 — CFNA: Bob never answers; his profile forwards NA to Carol, who
/// answers. The refer chain records Bob as already tried so a further NA
/// timeout on the same call cannot loop back to him.
#[test]
fn cfna_forwards_to_alternate_and_prevents_loop_back() {
    let registry = registry();
    let stack = stack_with(0);

    let bob = registry.create("102").unwrap();
    registry.refresh(bob, addr("10.0.0.6:5060"), "sip:102@10.0.0.6", 300);
    registry.with_entry_mut(bob, |e| {
        e.profile.forwarding.enable(ForwardMask::NA);
        e.profile.forward_to = Some("103".to_string());
    });
    let carol = registry.create("103").unwrap();
    registry.refresh(carol, addr("10.0.0.7:5060"), "sip:103@10.0.0.7", 300);

    let call = stack
        .create("call-3", CallKind::Incoming, "sip:101@10.0.0.5", "102", addr("10.0.0.5:5060"))
        .unwrap();
    stack.with_call(call, |c| c.begin_trying()).unwrap().unwrap();
    let bob_idx = stack
        .with_call(call, |c| c.add_segment(Segment::new("call-3-bob", "sip:101@10.0.0.5", "102")))
        .unwrap();
    stack.with_call(call, |c| c.segment_ringing(bob_idx)).unwrap().unwrap();
    stack.arm_ring_timer(stack.with_call(call, |c| c.id).unwrap());
    std::thread::sleep(std::time::Duration::from_millis(5));

    let pending = stack.sweep_with_forwarding(|c, kind| {
        if kind != TimerKind::Ring {
            return None;
        }
        let to_userid = c.target_userid()?;
        assert_eq!(to_userid, "102");
        let entry = registry.access(&to_userid)?;
        let alias = registry
            .with_entry(entry, |e| {
                if e.profile.forwarding.enabled(ForwardMask::NA) {
                    e.profile.forward_to.clone()
                } else {
                    None
                }
            })
            .flatten();
        registry.detach(entry);
        let alias = alias?;
        if !c.apply_forwarding(sipwitch_pbx::stack::ForwardingCause::Na, &to_userid) {
            return None;
        }
        let target = registry.invite(&alias).ok()?;
        let contacts = registry
            .with_entry(target, |e| {
                e.ranked_targets().into_iter().map(|t| (t.contact.clone(), t.address)).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        registry.detach(target);
        Some(ForwardDecision { to_userid: alias, contacts })
    });

    assert_eq!(pending.len(), 1, "Carol's leg should have been forked");
    assert!(pending[0].contact.contains("10.0.0.7"));

    let carol_idx = stack.find_by_cid(&pending[0].leg_cid).unwrap().1;
    let cancels = stack.with_call(call, |c| c.answer(carol_idx)).unwrap().unwrap();
    assert!(cancels.iter().any(|c| c.cid == "call-3-bob"), "Bob's leg must be cancelled, not joined");
    stack.with_call(call, |c| c.join()).unwrap().unwrap();
    assert_eq!(stack.with_call(call, |c| c.state()), Some(CallState::Joined));

    // Re-arming a second Ring timeout must not loop back to Bob: NA was
    // already applied for him on this call.
    stack.arm_ring_timer(stack.with_call(call, |c| c.id).unwrap());
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second_round = stack.sweep_with_forwarding(|c, kind| {
        if kind != TimerKind::Ring {
            return None;
        }
        if !c.apply_forwarding(sipwitch_pbx::stack::ForwardingCause::Na, "102") {
            return None;
        }
        unreachable!("loop prevention should have rejected this forward before reaching here");
    });
    assert!(second_round.is_empty());
}

/// S4 — Registry expiry: Alice registers with a short TTL and is not
/// refreshed; a sweep past that deadline expires her binding and a later
/// `invite` lookup fails as unreachable (480).
#[test]
fn unrefreshed_registration_expires_and_invite_then_fails() {
    // A real 70s wait would make this test glacial; instead the
    // configured min_expires is lowered to 1s so the same "register, don't
    // refresh, wait past the TTL" sequence plays out in a sleep the test
    // suite can actually afford.
    let mut cfg = PbxConfig::default_config().registry;
    cfg.min_expires = 1;
    let registry = Registry::new(cfg);

    let alice = registry.create("101").unwrap();
    registry.refresh(alice, addr("10.0.0.5:5060"), "sip:101@10.0.0.5", 1);
    assert!(registry.invite("101").is_ok());

    std::thread::sleep(std::time::Duration::from_millis(1100));

    let expired_count = registry.cleanup();
    assert_eq!(expired_count, 1);
    assert!(registry.invite("101").is_err());
}

/// S5 — Capacity: an arena capped at 2 calls rejects a third create, and
/// leaves no partial call object behind.
#[test]
fn capacity_limited_stack_rejects_third_call_cleanly() {
    let stack = stack_with(2);
    stack.create("call-a", CallKind::Incoming, "sip:a@x", "101", addr("10.0.0.5:5060")).unwrap();
    stack.create("call-b", CallKind::Incoming, "sip:a@x", "102", addr("10.0.0.5:5060")).unwrap();

    let result = stack.create("call-c", CallKind::Incoming, "sip:a@x", "103", addr("10.0.0.5:5060"));
    assert!(result.is_err());
    assert_eq!(stack.active_call_count(), 2, "the rejected third call left no partial state");
    assert!(stack.find_by_cid("call-c").is_none());
}

/// S6 — Parallel fork: three targets ring under DISTRIBUTED mode; the
/// first to answer wins and the other two segments are marked for CANCEL.
#[test]
fn parallel_fork_winner_cancels_the_other_two_legs() {
    let stack = stack_with(0);
    let call = stack
        .create("call-6", CallKind::Incoming, "sip:101@10.0.0.5", "group", addr("10.0.0.5:5060"))
        .unwrap();
    stack.with_call(call, |c| c.begin_trying()).unwrap().unwrap();

    let mut indices = Vec::new();
    for (n, ip) in ["10.0.0.11", "10.0.0.12", "10.0.0.13"].iter().enumerate() {
        let cid = format!("call-6-t{n}");
        let dest: SocketAddr = format!("{ip}:5060").parse().unwrap();
        let idx = stack
            .with_call(call, |c| {
                c.add_segment(
                    Segment::new(&cid, "sip:101@10.0.0.5", "group")
                        .with_destination(dest, &format!("sip:t{n}@{ip}")),
                )
            })
            .unwrap();
        stack.with_call(call, |c| c.segment_ringing(idx)).unwrap().unwrap();
        indices.push(idx);
    }
    assert_eq!(stack.with_call(call, |c| c.live_segment_count()).unwrap(), 4); // source + 3

    // T2 (index 1 of the three forked legs, i.e. indices[1]) answers first.
    let winner = indices[1];
    let cancels = stack.with_call(call, |c| c.answer(winner)).unwrap().unwrap();
    assert_eq!(cancels.len(), 2, "T1 and T3 must be cancelled");
    let cancelled_cids: Vec<_> = cancels.iter().map(|c| c.cid.clone()).collect();
    assert!(cancelled_cids.contains(&"call-6-t0".to_string()));
    assert!(cancelled_cids.contains(&"call-6-t2".to_string()));

    stack.with_call(call, |c| c.join()).unwrap().unwrap();
    assert_eq!(
        stack.with_call(call, |c| c.live_segment_count()).unwrap(),
        2,
        "only the source leg and T2's winning leg remain live"
    );
}
