//! `MappedRegistry` entry, `Target`, and per-user `Profile` policy.
//!
//! Field-for-field grounded on `registry::mapped` / `registry::target` in
//! `original_source/server/server.h`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    User,
    Gateway,
    Refer,
    Reject,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Ready,
    Busy,
    Away,
    Dnd,
}

/// One contact binding. A registry entry may hold several for multi-device
/// presence.
#[derive(Debug, Clone)]
pub struct Target {
    pub contact: String,
    pub address: SocketAddr,
    pub iface: SocketAddr,
    pub expires: i64,
    pub status: TargetStatus,
}

/// Per-user forwarding policy bitmask. A profile may enable more than one
/// cause simultaneously (e.g. both CFNA and CFB to different targets would
/// require distinct aliases in a richer model; this core keeps one
/// `forward` alias per cause set, matching the original's single
/// `fwdmask`/`forward` pair).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardMask(u32);

impl ForwardMask {
    pub const NONE: u32 = 0;
    pub const NA: u32 = 1 << 0;
    pub const BUSY: u32 = 1 << 1;
    pub const DND: u32 = 1 << 2;
    pub const AWAY: u32 = 1 << 3;
    pub const ALL: u32 = 1 << 4;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(bits: u32) -> Self {
        Self(bits)
    }

    pub fn enabled(&self, cause: u32) -> bool {
        self.0 & cause != 0
    }

    pub fn enable(&mut self, cause: u32) {
        self.0 |= cause;
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub max_calls: u32,
    pub forwarding: ForwardMask,
    /// Alias id consulted for any enabled forwarding cause.
    pub forward_to: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            max_calls: 4,
            forwarding: ForwardMask::empty(),
            forward_to: None,
        }
    }
}

pub struct RegistryEntry {
    pub userid: String,
    pub ext: u32,
    kind: EntryType,
    pub profile: Profile,
    pub created: i64,
    expires: i64,
    inuse: AtomicU32,
    pub targets: Vec<Target>,
    /// Alias ids this entry also answers to (`published` in the original).
    pub published: Vec<String>,
    pub authid: String,
    pub secret: String,
}

impl RegistryEntry {
    pub fn new(userid: &str) -> Self {
        Self {
            userid: userid.to_string(),
            ext: userid.parse().unwrap_or(0),
            kind: EntryType::User,
            profile: Profile::default(),
            created: now(),
            expires: 0,
            inuse: AtomicU32::new(0),
            targets: Vec::new(),
            published: Vec::new(),
            authid: String::new(),
            secret: String::new(),
        }
    }

    pub fn kind(&self) -> EntryType {
        self.kind
    }

    pub fn set_kind(&mut self, kind: EntryType) {
        self.kind = kind;
    }

    pub fn expires(&self) -> i64 {
        self.expires
    }

    pub fn inuse(&self) -> u32 {
        self.inuse.load(Ordering::SeqCst)
    }

    pub fn inc_use(&self) {
        self.inuse.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_use(&self) {
        self.inuse.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        }).ok();
    }

    /// Renew (or add) the primary target. Matches the original's
    /// `refresh(addr, expires)`: if the source address is unchanged this
    /// updates the existing target in place; otherwise (a second device,
    /// or a contact move) it is added as a new target so existing devices
    /// keep ringing too.
    pub fn refresh(&mut self, addr: SocketAddr, contact: &str, expires_at: i64) {
        self.kind = EntryType::User;
        self.expires = expires_at;
        if let Some(target) = self.targets.iter_mut().find(|t| t.address == addr) {
            target.expires = expires_at;
            target.contact = contact.to_string();
            return;
        }
        self.targets.push(Target {
            contact: contact.to_string(),
            address: addr,
            iface: addr,
            expires: expires_at,
            status: TargetStatus::Ready,
        });
    }

    pub fn mark_expired(&mut self) {
        self.kind = EntryType::Expired;
        self.targets.clear();
        self.expires = 0;
    }

    /// Targets sorted by priority (here: freshest-first, i.e. descending
    /// `expires`), per the tie-break rule in spec.md §4.3.
    pub fn ranked_targets(&self) -> Vec<&Target> {
        let mut v: Vec<&Target> = self.targets.iter().collect();
        v.sort_by(|a, b| b.expires.cmp(&a.expires));
        v
    }
}
