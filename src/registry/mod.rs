//! The registry: a bounded, shared map from user identifier to active
//! contact bindings, with expiration, multi-device presence, and a
//! routing-pattern table.
//!
//! Grounded on the contract in `server.h`'s `registry` class and
//! `MappedRegistry`/`target`/`pattern` structures (see
//! `original_source/server/server.h`): `create`/`access`/`invite`/
//! `address`/`contact`/`refresh`/`expire`/`getRouting`/`cleanup` all have a
//! direct counterpart here. The id-hash + intrusive free list of the
//! original becomes an [`Arena`] plus a [`DashMap`] id index, matched by
//! the teacher's use of `DashMap` for its session/call tables
//! (`services/sip_router.rs`, `services/b2bua.rs`).

mod entry;
mod messages;
mod pattern;

pub use entry::{EntryType, ForwardMask, Profile, RegistryEntry, Target, TargetStatus};
pub use messages::{Message, MessageStore};
pub use pattern::PatternRule;

use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::arena::{Arena, Handle};
use crate::config::RegistryConfig;
use crate::error::Error;
use crate::Result;

pub type RegistryHandle = Handle<RegistryEntry>;

/// Snapshot-friendly summary of one entry, used by the control channel.
#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub userid: String,
    pub kind: EntryType,
    pub ext: u32,
    pub contact: Option<String>,
    pub expires: i64,
    pub targets: usize,
}

struct PatternBinding {
    entry: RegistryHandle,
    rule: PatternRule,
}

struct Inner {
    arena: Arena<RegistryEntry>,
    by_id: DashMap<String, RegistryHandle>,
    /// Ordered highest-priority first; rebuilt in place on insert.
    patterns: Vec<PatternBinding>,
}

/// Bounded, shared-memory-style registry. All mutation paths take the
/// single `RwLock` briefly and synchronously — never across an `.await` —
/// matching the "registry-shared < call-mutex < transport-lock" lock
/// order mandated by the design.
pub struct Registry {
    inner: RwLock<Inner>,
    config: RegistryConfig,
    pub messages: MessageStore,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        let capacity = config.mapped;
        Self {
            inner: RwLock::new(Inner {
                arena: Arena::new(capacity),
                by_id: DashMap::new(),
                patterns: Vec::new(),
            }),
            messages: MessageStore::new(config.message_ttl_s),
            config,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.config.keysize
    }

    /// `create(id)` — idempotently returns or allocates the entry for `id`.
    pub fn create(&self, id: &str) -> Result<RegistryHandle> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.by_id.get(id) {
            return Ok(*existing);
        }
        let entry = RegistryEntry::new(id);
        let handle = inner.arena.allocate(entry)?;
        inner.by_id.insert(id.to_string(), handle);
        info!(user = id, "registry: created entry");
        Ok(handle)
    }

    /// `access(id)` — read-only lookup; increments `inuse`. Caller must
    /// call [`Registry::detach`] when done with the handle.
    pub fn access(&self, id: &str) -> Option<RegistryHandle> {
        let inner = self.inner.read().unwrap();
        let handle = *inner.by_id.get(id)?;
        let entry = inner.arena.get(handle)?;
        entry.inc_use();
        Some(handle)
    }

    /// `invite(id)` — like `access`, but fails if the entry is EXPIRED or
    /// REJECT.
    pub fn invite(&self, id: &str) -> Result<RegistryHandle> {
        let inner = self.inner.read().unwrap();
        let handle = *inner
            .by_id
            .get(id)
            .ok_or_else(|| Error::unknown_route(id.to_string()))?;
        let entry = inner
            .arena
            .get(handle)
            .ok_or_else(|| Error::unknown_route(id.to_string()))?;
        match entry.kind() {
            EntryType::Expired => return Err(Error::unreachable(id.to_string())),
            EntryType::Reject => return Err(Error::authorization(format!("{id} is rejected"))),
            _ => {}
        }
        entry.inc_use();
        Ok(handle)
    }

    /// Release a reference taken by `access`/`invite`. Entries with
    /// `inuse == 0` after an expiry become eligible for id-hash removal on
    /// the next `cleanup` sweep.
    pub fn detach(&self, handle: RegistryHandle) {
        let inner = self.inner.read().unwrap();
        if let Some(entry) = inner.arena.get(handle) {
            entry.dec_use();
        }
    }

    pub fn with_entry<R>(&self, handle: RegistryHandle, f: impl FnOnce(&RegistryEntry) -> R) -> Option<R> {
        let inner = self.inner.read().unwrap();
        inner.arena.get(handle).map(f)
    }

    pub fn with_entry_mut<R>(
        &self,
        handle: RegistryHandle,
        f: impl FnOnce(&mut RegistryEntry) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write().unwrap();
        inner.arena.get_mut(handle).map(f)
    }

    /// `address(sockaddr)` — reverse lookup by current primary contact
    /// address.
    pub fn address(&self, addr: SocketAddr) -> Option<RegistryHandle> {
        let inner = self.inner.read().unwrap();
        inner
            .arena
            .iter()
            .find(|(_, entry)| entry.targets.iter().any(|t| t.address == addr))
            .map(|(handle, _)| handle)
    }

    /// `contact(uri)` — resolve a bare user-part or full URI to an entry.
    pub fn contact(&self, uri: &str) -> Option<RegistryHandle> {
        let id = extract_userid(uri);
        let inner = self.inner.read().unwrap();
        inner.by_id.get(id).map(|h| *h)
    }

    /// `contact(sockaddr, uid)` combined form.
    pub fn contact_from(&self, addr: SocketAddr, uid: &str) -> Option<RegistryHandle> {
        if let Some(h) = self.contact(uid) {
            return Some(h);
        }
        self.address(addr)
    }

    /// `refresh(entry, addr, expires)` — renew TTL; replace the primary
    /// target if the source address changed, or add a new target for a
    /// second simultaneous device.
    pub fn refresh(&self, handle: RegistryHandle, addr: SocketAddr, contact: &str, requested: u32) {
        let expires_s = self.clamp_expires(requested);
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.arena.get_mut(handle) {
            entry.refresh(addr, contact, now() + expires_s as i64);
            info!(user = entry.userid.as_str(), expires_s, "registry: refreshed");
        }
    }

    pub fn clamp_expires(&self, requested: u32) -> u32 {
        if requested == 0 {
            return 0;
        }
        requested
            .max(self.config.min_expires)
            .min(self.config.max_expires)
    }

    pub fn default_expires(&self) -> u32 {
        self.config.default_expires
    }

    /// `expire(entry)` — mark the entry's primary binding EXPIRED and
    /// clear its targets. The record itself survives if `inuse > 0`.
    pub fn expire(&self, handle: RegistryHandle) {
        let mut inner = self.inner.write().unwrap();
        let mut removable = false;
        if let Some(entry) = inner.arena.get_mut(handle) {
            entry.mark_expired();
            removable = entry.inuse() == 0;
            warn!(user = entry.userid.as_str(), "registry: entry expired");
        }
        if removable {
            if let Some(entry) = inner.arena.get(handle) {
                let id = entry.userid.clone();
                inner.by_id.remove(&id);
            }
        }
    }

    /// `getRouting(trs, id)` — scan patterns highest-priority first;
    /// return the first whose prefix/suffix wraps the dialed string.
    pub fn get_routing(&self, id: &str) -> Option<RegistryHandle> {
        let inner = self.inner.read().unwrap();
        inner
            .patterns
            .iter()
            .find(|binding| binding.rule.matches(id))
            .map(|binding| binding.entry)
    }

    /// `addRoute` — insert a pattern for `handle`, keeping the table
    /// ordered by descending priority.
    pub fn add_route(&self, handle: RegistryHandle, rule: PatternRule) {
        let mut inner = self.inner.write().unwrap();
        let pos = inner
            .patterns
            .iter()
            .position(|b| b.rule.priority < rule.priority)
            .unwrap_or(inner.patterns.len());
        inner.patterns.insert(pos, PatternBinding { entry: handle, rule });
    }

    /// `isExtension(id)` — numeric, within `[prefix, prefix+range)`.
    pub fn is_extension(&self, id: &str, prefix: u32, range: u32) -> bool {
        match id.parse::<u32>() {
            Ok(n) => n >= prefix && n < prefix + range,
            Err(_) => false,
        }
    }

    /// `cleanup(period)` — sweep all entries; expire whichever have an
    /// expired TTL. Returns the number of entries expired.
    pub fn cleanup(&self) -> usize {
        let due: Vec<RegistryHandle> = {
            let inner = self.inner.read().unwrap();
            let t = now();
            inner
                .arena
                .iter()
                .filter(|(_, e)| e.kind() != EntryType::Expired && e.expires() != 0 && e.expires() < t)
                .map(|(h, _)| h)
                .collect()
        };
        for handle in &due {
            self.expire(*handle);
        }
        due.len()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().unwrap().arena.live_count()
    }

    pub fn snapshot(&self) -> Vec<EntrySummary> {
        let inner = self.inner.read().unwrap();
        inner
            .arena
            .iter()
            .map(|(_, e)| EntrySummary {
                userid: e.userid.clone(),
                kind: e.kind(),
                ext: e.ext,
                contact: e.targets.first().map(|t| t.contact.clone()),
                expires: e.expires(),
                targets: e.targets.len(),
            })
            .collect()
    }
}

/// Bare user-part of a SIP URI (`sip:101@10.0.0.5` -> `101`), shared by
/// the registry's own `contact` lookup and the worker's request routing.
pub fn extract_userid(uri: &str) -> &str {
    let without_scheme = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    let user_part = without_scheme.split('@').next().unwrap_or(without_scheme);
    user_part
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;

    fn registry() -> Registry {
        Registry::new(PbxConfig::default_config().registry)
    }

    #[test]
    fn create_is_idempotent() {
        let reg = registry();
        let a = reg.create("101").unwrap();
        let b = reg.create("101").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn access_increments_inuse_and_detach_releases() {
        let reg = registry();
        let h = reg.create("101").unwrap();
        let accessed = reg.access("101").unwrap();
        assert_eq!(h, accessed);
        reg.with_entry(h, |e| assert_eq!(e.inuse(), 1));
        reg.detach(accessed);
        reg.with_entry(h, |e| assert_eq!(e.inuse(), 0));
    }

    #[test]
    fn refresh_clamps_to_configured_range() {
        let reg = registry();
        let h = reg.create("101").unwrap();
        let addr: SocketAddr = "10.0.0.5:5060".parse().unwrap();
        reg.refresh(h, addr, "sip:101@10.0.0.5", 5); // below min_expires (60)
        reg.with_entry(h, |e| {
            let delta = e.expires() - now();
            assert!((58..=62).contains(&delta), "delta={delta}");
        });
    }

    #[test]
    fn expire_removes_entry_with_no_inuse() {
        let reg = registry();
        let h = reg.create("101").unwrap();
        reg.expire(h);
        assert!(reg.access("101").is_none());
    }

    #[test]
    fn expire_keeps_record_while_inuse() {
        let reg = registry();
        let h = reg.create("101").unwrap();
        let _held = reg.access("101").unwrap();
        reg.expire(h);
        // id-hash lookup no longer resolves a live registration...
        assert!(reg.with_entry(h, |e| e.kind()) == Some(EntryType::Expired));
    }

    #[test]
    fn invite_rejects_expired_entries() {
        let reg = registry();
        let h = reg.create("101").unwrap();
        let _held = reg.access("101").unwrap();
        reg.expire(h);
        assert!(reg.invite("101").is_err());
    }

    #[test]
    fn routing_returns_highest_priority_match() {
        let reg = registry();
        let low = reg.create("gw-low").unwrap();
        let high = reg.create("gw-high").unwrap();
        reg.add_route(low, PatternRule::new("low", "9", "", 1));
        reg.add_route(high, PatternRule::new("high", "9", "", 10));
        assert_eq!(reg.get_routing("911"), Some(high));
    }

    #[test]
    fn capacity_exhausted_surfaces_as_error() {
        let mut cfg = PbxConfig::default_config().registry;
        cfg.mapped = 1;
        let reg = Registry::new(cfg);
        reg.create("101").unwrap();
        assert!(reg.create("102").is_err());
    }
}
