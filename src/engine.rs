//! The top-level object owning the registry, call/session stack, worker
//! pool, background expirer, and control channel.
//!
//! Owns, starts, and stops the registry/stack/worker graph the way
//! `RedFireGateway` owns its TDMoE/FreeTDM/SNMP service graph, but wired
//! to SIP registration and call state instead. Every long-lived piece of
//! state a C implementation would keep as a global (free lists, hash
//! table, reply target) is a field here instead, with an explicit
//! teardown order — workers first, then the background sweep, then the
//! control channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::DigestAuth;
use crate::config::PbxConfig;
use crate::control::{ControlChannel, ControlCommand};
use crate::protocols::RtpProxyHook;
use crate::registry::{EntryType, Registry};
use crate::stack::{Call, ForwardingCause, Stack, TimerKind};
use crate::transport::{OutboundMessage, SipMethod, Transport};
use crate::worker::Worker;
use crate::Result;

/// What a call that never leaves INITIAL, a 503, or an expired binding
/// looks like from the outside — surfaced through `snapshot`/`dump`.
pub struct EngineStatus {
    pub mapped_calls: usize,
    pub active_calls: usize,
    pub active_sessions: usize,
    pub allocated_calls: usize,
    pub allocated_sessions: usize,
    pub registered_users: usize,
    pub pending_messages: usize,
    pub uptime: Duration,
}

/// The single struct a running process owns: the Rust replacement for a
/// C implementation's collection of global statics.
pub struct Engine {
    pub registry: Arc<Registry>,
    pub stack: Arc<Stack>,
    pub auth: Arc<DigestAuth>,
    pub rtp: Arc<RtpProxyHook>,
    pub config: Arc<PbxConfig>,
    transport: Arc<dyn Transport>,
    control: Option<Arc<ControlChannel>>,
    shutdown: Arc<AtomicBool>,
    restart_requested: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Option<JoinHandle<()>>>,
    control_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    started_at: Instant,
}

impl Engine {
    pub fn new(config: PbxConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.registry.clone()));
        let stack = Arc::new(Stack::new(config.stack.clone()));
        let auth = Arc::new(DigestAuth::new(&config.registry.realm));
        let rtp = Arc::new(RtpProxyHook::new(&config.rtp));
        let control = config
            .control
            .path
            .as_ref()
            .map(|path| Arc::new(ControlChannel::new(path.clone())));

        Self {
            registry,
            stack,
            auth,
            rtp,
            config,
            transport,
            control,
            shutdown: Arc::new(AtomicBool::new(false)),
            restart_requested: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            background: Mutex::new(None),
            control_thread: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Spawn the worker pool, the background expirer, and (if configured)
    /// the control channel reader.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            workers = self.config.stack.worker_threads,
            "engine: starting worker pool"
        );
        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        for _ in 0..self.config.stack.worker_threads {
            let worker = Worker::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.stack),
                Arc::clone(&self.auth),
                Arc::clone(&self.transport),
                Arc::clone(&self.config),
            );
            workers.push(tokio::spawn(worker.run()));
        }
        drop(workers);

        *self.background.lock().expect("background mutex poisoned") =
            Some(tokio::spawn(Arc::clone(self).background_loop()));

        if let Some(control) = &self.control {
            control.create_fifo()?;
            let engine = Arc::clone(self);
            let handle = Arc::clone(control).spawn(move |cmd| engine.dispatch_control(cmd));
            *self.control_thread.lock().expect("control thread mutex poisoned") = Some(handle);
        }

        Ok(())
    }

    /// Teardown order: workers first (stop consuming new events), then
    /// the background sweep (stop mutating state), then the control
    /// channel and arena-backed structures drop with the `Arc`.
    pub async fn stop(&self) {
        info!("engine: stopping");
        self.shutdown.store(true, Ordering::SeqCst);

        for worker in self.workers.lock().expect("workers mutex poisoned").drain(..) {
            worker.abort();
        }
        if let Some(bg) = self.background.lock().expect("background mutex poisoned").take() {
            bg.abort();
        }
        if let Some(control) = &self.control {
            control.request_shutdown();
        }
        if let Some(thread) = self.control_thread.lock().expect("control thread mutex poisoned").take() {
            // The fifo reader blocks on I/O; it exits on its own once a
            // writer opens/closes the pipe again or the process exits.
            drop(thread);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    async fn background_loop(self: Arc<Self>) {
        let base_interval = Duration::from_millis(self.config.stack.timing_ms);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let sleep_for = self
                .stack
                .timers
                .next_deadline_ms()
                .map(|ms| Duration::from_millis(ms as u64).min(base_interval))
                .unwrap_or(base_interval);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.sweep_once().await;
        }
    }

    /// One background-thread wake: sweep the timer queue (with CFNA
    /// forwarding resolution), expire registry bindings, flush stale
    /// offline messages and auth nonces, then let the transport
    /// retransmit/timeout its own transactions.
    async fn sweep_once(&self) {
        let registry = Arc::clone(&self.registry);
        let pending = self.stack.sweep_with_forwarding(|call, kind| {
            Self::resolve_forwarding(&registry, call, kind)
        });
        for invite in pending {
            let message = OutboundMessage::Request {
                method: SipMethod::Invite,
                request_uri: invite.contact.clone(),
                call_id: invite.leg_cid.clone(),
                body: None,
                destination: invite.destination,
            };
            if let Err(e) = self.transport.send(message).await {
                warn!("engine: failed to send forwarded INVITE: {e}");
            }
        }

        let expired = self.registry.cleanup();
        if expired > 0 {
            info!(expired, "engine: registry sweep expired bindings");
        }
        self.registry.messages.sweep_expired();
        self.auth.sweep_expired_nonces();
        self.transport.automatic_action().await;
    }

    /// CFNA resolution consulted from [`Stack::sweep_with_forwarding`]:
    /// on a Ring timeout, check whether the currently-rung target has
    /// unconditional-no-answer forwarding enabled and, if so and the
    /// forward alias hasn't already been tried on this call (loop
    /// prevention), resolve it to a fresh set of contacts.
    fn resolve_forwarding(
        registry: &Registry,
        call: &Call,
        kind: TimerKind,
    ) -> Option<crate::stack::ForwardDecision> {
        if kind != TimerKind::Ring {
            return None;
        }
        let from_userid = call.target_userid()?;
        let entry = registry.access(&from_userid)?;
        let alias = registry
            .with_entry(entry, |e| {
                if e.profile.forwarding.enabled(crate::registry::ForwardMask::NA) {
                    e.profile.forward_to.clone()
                } else {
                    None
                }
            })
            .flatten();
        registry.detach(entry);
        let alias = alias?;

        if !call.apply_forwarding(ForwardingCause::Na, &from_userid) {
            return None;
        }

        let forward_handle = registry.invite(&alias).ok()?;
        let contacts = registry
            .with_entry(forward_handle, |e| {
                e.ranked_targets()
                    .into_iter()
                    .map(|t| (t.contact.clone(), t.address))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        registry.detach(forward_handle);
        if contacts.is_empty() {
            return None;
        }
        Some(crate::stack::ForwardDecision {
            to_userid: alias,
            contacts,
        })
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            mapped_calls: self.stack.mapped_calls(),
            active_calls: self.stack.active_call_count(),
            active_sessions: self.stack.active_session_count(),
            allocated_calls: self.stack.allocated_call_count(),
            allocated_sessions: self.stack.allocated_session_count(),
            registered_users: self.registry.entry_count(),
            pending_messages: self.registry.messages.total_pending(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// `SIP Stack: ...` / `Registry: ...` plaintext status report.
    pub fn snapshot(&self) -> String {
        let status = self.status();
        let mut out = String::new();
        out.push_str("SIP Stack:\n");
        out.push_str(&format!("  mapped calls: {}\n", status.mapped_calls));
        out.push_str(&format!("  active calls: {}\n", status.active_calls));
        out.push_str(&format!("  active sessions: {}\n", status.active_sessions));
        out.push_str(&format!("  allocated calls: {}\n", status.allocated_calls));
        out.push_str(&format!("  allocated sessions: {}\n", status.allocated_sessions));
        out.push_str("Registry:\n");
        for entry in self.registry.snapshot() {
            out.push_str(&format!(
                "  {} type={:?} ext={} contact={} expires={} targets={}\n",
                entry.userid,
                entry.kind,
                entry.ext,
                entry.contact.as_deref().unwrap_or("-"),
                entry.expires,
                entry.targets,
            ));
        }
        out
    }

    /// `dump` — `snapshot` plus provisioned-but-never-registered
    /// profiles: entries sitting in EXPIRED
    /// state with no live target are listed separately so an operator can
    /// tell "never registered" apart from "registered, then timed out".
    pub fn dump(&self) -> String {
        let mut out = self.snapshot();
        out.push_str("Provisioned (unregistered):\n");
        for entry in self.registry.snapshot() {
            if entry.kind == EntryType::Expired && entry.targets == 0 {
                out.push_str(&format!("  {} ext={}\n", entry.userid, entry.ext));
            }
        }
        out
    }

    fn dispatch_control(&self, cmd: ControlCommand) -> (bool, String) {
        match cmd.verb.as_str() {
            "snapshot" => (true, self.snapshot()),
            "dump" => (true, self.dump()),
            "check" => (true, "ok".to_string()),
            "reload" => (true, "reload not supported at runtime; restart to pick up config changes".to_string()),
            "drop" => match cmd.args.first() {
                Some(id) => match self.registry.access(id) {
                    Some(handle) => {
                        self.registry.detach(handle);
                        self.registry.expire(handle);
                        (true, format!("dropped {id}"))
                    }
                    None => (false, format!("no such id: {id}")),
                },
                None => (false, "drop requires <id>".to_string()),
            },
            "register" => match (cmd.args.first(), cmd.args.get(1)) {
                (Some(id), Some(addr)) => match addr.parse::<SocketAddr>() {
                    Ok(addr) => {
                        let handle = match self.registry.create(id) {
                            Ok(h) => h,
                            Err(e) => return (false, e.to_string()),
                        };
                        let contact = format!("sip:{id}@{addr}");
                        let expires = self.registry.default_expires();
                        self.registry.refresh(handle, addr, &contact, expires);
                        (true, format!("registered {id} at {addr}"))
                    }
                    Err(e) => (false, format!("invalid address {addr}: {e}")),
                },
                _ => (false, "register requires <id> <addr>".to_string()),
            },
            "message" => match (cmd.args.first(), cmd.args.get(1..)) {
                (Some(to), Some(rest)) if !rest.is_empty() => {
                    let body = rest.join(" ");
                    self.registry.messages.publish("control", to, &body, "text/plain");
                    (true, format!("queued message for {to}"))
                }
                _ => (false, "message requires <to> <body>".to_string()),
            },
            "stop" => {
                self.shutdown.store(true, Ordering::SeqCst);
                (true, "stopping".to_string())
            }
            "restart" => {
                self.restart_requested.store(true, Ordering::SeqCst);
                self.shutdown.store(true, Ordering::SeqCst);
                (true, "restarting".to_string())
            }
            other => (false, format!("unknown command: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct NullTransport {
        sent: AsyncMutex<Vec<OutboundMessage>>,
    }

    impl NullTransport {
        fn new() -> Self {
            Self { sent: AsyncMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn event_wait(&self) -> Result<crate::transport::SipEvent> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn send(&self, message: OutboundMessage) -> Result<()> {
            self.sent.lock().await.push(message);
            Ok(())
        }
        async fn automatic_action(&self) {}
        fn local_addr(&self) -> SocketAddr {
            "0.0.0.0:0".parse().unwrap()
        }
    }

    fn engine() -> Engine {
        Engine::new(PbxConfig::default_config(), Arc::new(NullTransport::new()))
    }

    #[test]
    fn snapshot_reports_registered_entries() {
        let e = engine();
        let h = e.registry.create("101").unwrap();
        e.registry.refresh(h, "10.0.0.5:5060".parse().unwrap(), "sip:101@10.0.0.5", 300);
        let out = e.snapshot();
        assert!(out.contains("SIP Stack:"));
        assert!(out.contains("101"));
    }

    #[test]
    fn dispatch_register_command_creates_binding() {
        let e = engine();
        let (ok, _) = e.dispatch_control(ControlCommand {
            reply_to: None,
            verb: "register".to_string(),
            args: vec!["101".to_string(), "10.0.0.5:5060".to_string()],
        });
        assert!(ok);
        assert!(e.registry.access("101").is_some());
    }

    #[test]
    fn dispatch_unknown_command_fails() {
        let e = engine();
        let (ok, _) = e.dispatch_control(ControlCommand {
            reply_to: None,
            verb: "frobnicate".to_string(),
            args: vec![],
        });
        assert!(!ok);
    }

    #[test]
    fn dispatch_stop_sets_shutdown_flag() {
        let e = engine();
        assert!(!e.is_shutting_down());
        e.dispatch_control(ControlCommand {
            reply_to: None,
            verb: "stop".to_string(),
            args: vec![],
        });
        assert!(e.is_shutting_down());
    }

    #[test]
    fn dispatch_restart_sets_both_flags() {
        let e = engine();
        e.dispatch_control(ControlCommand {
            reply_to: None,
            verb: "restart".to_string(),
            args: vec![],
        });
        assert!(e.is_shutting_down());
        assert!(e.restart_requested());
    }

    #[test]
    fn dispatch_message_without_body_fails() {
        let e = engine();
        let (ok, _) = e.dispatch_control(ControlCommand {
            reply_to: None,
            verb: "message".to_string(),
            args: vec!["101".to_string()],
        });
        assert!(!ok);
    }
}
