//! Per-event decision cascade: identify, classify, authenticate,
//! authorize, dispatch, reply.
//!
//! Grounded on the worker-thread contract in `original_source/server/server.h`
//! (`thread::run`) and on the event-channel idiom in
//! `services/sip_router.rs`, generalized from a stub router into the real
//! registry/stack-driven handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{AuthorizationHeader, DigestAuth};
use crate::config::{AclConfig, PbxConfig};
use crate::error::Error;
use crate::registry::Registry;
use crate::stack::{CallHandle, CallKind, CallState, CancelTarget, Segment, Stack};
use crate::transport::{
    OutboundMessage, SipEvent, SipMethod, SipRequestEvent, SipResponseEvent, Transport,
};
use crate::Result;

/// Classification of where an inbound request originated, per §4.4 step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceClass {
    External,
    Local,
    Public,
    Routed,
    Forwarded,
}

fn classify_source(acl: &AclConfig, source: SocketAddr, domain: &str, to_uri: &str) -> SourceClass {
    let source_ip = source.ip().to_string();
    if acl.trusted.iter().any(|t| t == &source_ip) {
        return SourceClass::Local;
    }
    if acl.restricted.iter().any(|t| t == &source_ip) {
        return SourceClass::Forwarded;
    }
    if to_uri.contains(domain) {
        return SourceClass::Routed;
    }
    if acl.localnames.iter().any(|n| to_uri.contains(n.as_str())) {
        return SourceClass::Public;
    }
    SourceClass::External
}

/// Whether this method, from this source, must be challenged before
/// dispatch — REGISTER/INVITE/MESSAGE from anything but a trusted LOCAL
/// source, per §4.4 step 3.
fn requires_authentication(method: SipMethod, class: SourceClass) -> bool {
    matches!(method, SipMethod::Register | SipMethod::Invite | SipMethod::Message)
        && class != SourceClass::Local
}

pub struct Worker {
    registry: Arc<Registry>,
    stack: Arc<Stack>,
    auth: Arc<DigestAuth>,
    transport: Arc<dyn Transport>,
    config: Arc<PbxConfig>,
}

impl Worker {
    pub fn new(
        registry: Arc<Registry>,
        stack: Arc<Stack>,
        auth: Arc<DigestAuth>,
        transport: Arc<dyn Transport>,
        config: Arc<PbxConfig>,
    ) -> Self {
        Self {
            registry,
            stack,
            auth,
            transport,
            config,
        }
    }

    /// Drains events from the transport until it returns an error
    /// (channel closed — shutdown).
    pub async fn run(self) {
        loop {
            match self.transport.event_wait().await {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    warn!("worker: transport closed: {e}");
                    break;
                }
            }
        }
    }

    pub async fn handle_event(&self, event: SipEvent) {
        match event {
            SipEvent::Request(req) => self.handle_request(req).await,
            SipEvent::Response(resp) => self.handle_response(resp).await,
            SipEvent::TransactionTimeout { call_id } => {
                warn!(call_id = call_id.as_str(), "worker: transaction timeout");
                if let Some((handle, _)) = self.stack.find_by_cid(&call_id) {
                    self.stack.with_call(handle, |c| c.terminate("transaction-timeout"));
                }
            }
        }
    }

    async fn handle_request(&self, req: SipRequestEvent) {
        let class = classify_source(&self.config.acl, req.source, &self.config.sip.domain, &req.to_uri);

        if requires_authentication(req.method, class) {
            if let Err(reply) = self.authenticate(&req).await {
                self.send_reply(&req, reply).await;
                return;
            }
        }

        let outcome = match req.method {
            SipMethod::Register => self.handle_register(&req),
            SipMethod::Invite => self.handle_invite(&req).await,
            SipMethod::Ack => self.handle_ack(&req),
            SipMethod::Bye => self.handle_bye(&req),
            SipMethod::Cancel => self.handle_cancel(&req),
            SipMethod::Options => Ok((200, "OK".to_string())),
            SipMethod::Message => self.handle_message(&req),
            SipMethod::Notify | SipMethod::Subscribe => Ok((200, "OK".to_string())),
            SipMethod::Refer | SipMethod::Info | SipMethod::Other => {
                Err(Error::not_supported("unhandled method"))
            }
        };

        // ACK gets no reply per §4.4 step 6.
        if req.method == SipMethod::Ack {
            return;
        }

        match outcome {
            Ok((status, reason)) => self.send_reply(&req, (status, reason)).await,
            Err(e) => self.send_reply(&req, (e.status_code(), e.to_string())).await,
        }
    }

    async fn authenticate(&self, req: &SipRequestEvent) -> std::result::Result<(), (u16, String)> {
        let Some(raw) = &req.authorization else {
            let challenge = self.auth.challenge();
            return Err((401, challenge.to_header_value()));
        };
        let header = AuthorizationHeader::parse(raw).map_err(|e| (400, e.to_string()))?;
        let Some(entry_handle) = self.registry.access(&header.username) else {
            return Err((404, "no such user".to_string()));
        };
        let ha1 = self
            .registry
            .with_entry(entry_handle, |e| e.secret.clone())
            .unwrap_or_default();
        self.registry.detach(entry_handle);
        let method_name = format!("{:?}", req.method).to_uppercase();
        self.auth
            .verify(&header, &ha1, &method_name)
            .map_err(|e| (e.status_code(), e.to_string()))
    }

    fn handle_register(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        let userid = crate::registry::extract_userid(&req.to_uri);
        let handle = self.registry.create(&userid)?;
        let requested = req.expires.unwrap_or(self.registry.default_expires());
        if requested == 0 {
            self.registry.expire(handle);
            info!(user = userid.as_str(), "worker: registration removed");
            return Ok((200, "OK".to_string()));
        }
        let contact = req.contact.clone().unwrap_or_else(|| req.from_uri.clone());
        self.registry.refresh(handle, req.source, &contact, requested);
        for msg in self.registry.messages.drain(&userid) {
            info!(user = userid.as_str(), from = msg.from.as_str(), "worker: delivering queued MESSAGE");
        }
        Ok((200, "OK".to_string()))
    }

    /// INITIAL --INVITE valid--> TRYING. Resolves the callee's ranked
    /// targets and actually sends one outbound INVITE per leg; the call
    /// stays in TRYING until a real 180/200/486/etc response (handled by
    /// [`Worker::handle_response`]) drives it into RINGING and beyond —
    /// this must never synthesize a ring itself.
    async fn handle_invite(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        let to_userid = crate::registry::extract_userid(&req.to_uri);
        let target_handle = self.registry.invite(&to_userid)?;

        let max_calls = self
            .registry
            .with_entry(target_handle, |e| e.profile.max_calls)
            .unwrap_or(0);
        if self.registry.with_entry(target_handle, |e| e.inuse()).unwrap_or(0) > max_calls {
            self.registry.detach(target_handle);
            return Err(Error::authorization("call cap exceeded"));
        }

        let call_handle = self
            .stack
            .create(&req.call_id, CallKind::Incoming, &req.from_uri, &to_userid, req.source)?;
        self.stack.with_call(call_handle, |c| c.begin_trying())
            .unwrap_or_else(|| Err(Error::internal("call vanished")))?;

        let targets = self
            .registry
            .with_entry(target_handle, |e| {
                e.ranked_targets()
                    .into_iter()
                    .map(|t| (t.contact.clone(), t.address))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        self.registry.detach(target_handle);

        if targets.is_empty() {
            self.stack.with_call(call_handle, |c| c.unreachable());
            return Err(Error::unreachable(to_userid));
        }

        for (n, (contact, destination)) in targets.iter().enumerate() {
            let leg_cid = format!("{}-t{n}", req.call_id);
            let idx = self
                .stack
                .with_call(call_handle, |c| {
                    c.add_segment(
                        Segment::new(&leg_cid, &req.from_uri, &to_userid)
                            .with_destination(*destination, contact),
                    )
                })
                .unwrap_or(0);
            self.stack.index_segment(&leg_cid, call_handle, idx);
            self.stack.note_segment_allocated();

            let invite = OutboundMessage::Request {
                method: SipMethod::Invite,
                request_uri: contact.clone(),
                call_id: leg_cid,
                body: None,
                destination: *destination,
            };
            if let Err(e) = self.transport.send(invite).await {
                warn!("worker: failed to send INVITE to {contact}: {e}");
            }
        }
        self.stack.arm_ring_timer(call_handle_id(&self.stack, call_handle));

        Ok((100, "Trying".to_string()))
    }

    fn handle_ack(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        if let Some((handle, _)) = self.stack.find_by_cid(&req.call_id) {
            self.stack.with_call(handle, |c| c.join()).unwrap_or(Ok(()))?;
        }
        Ok((200, "OK".to_string()))
    }

    fn handle_bye(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        if let Some((handle, _)) = self.stack.find_by_cid(&req.call_id) {
            self.stack.with_call(handle, |c| c.terminate("bye"));
        }
        Ok((200, "OK".to_string()))
    }

    fn handle_cancel(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        if let Some((handle, _)) = self.stack.find_by_cid(&req.call_id) {
            self.stack.with_call(handle, |c| c.terminate("cancel"));
        }
        Ok((200, "OK".to_string()))
    }

    fn handle_message(&self, req: &SipRequestEvent) -> Result<(u16, String)> {
        let to_userid = crate::registry::extract_userid(&req.to_uri);
        let handle = self
            .registry
            .access(&to_userid)
            .ok_or_else(|| Error::unknown_route(to_userid.to_string()))?;
        self.registry.detach(handle);
        self.registry
            .messages
            .publish(&req.from_uri, &to_userid, &req.body, "text/plain");
        Ok((202, "Accepted".to_string()))
    }

    /// Routes an inbound response against the segment it answers, driving
    /// the matching `Call` transition — this is the callee half of the
    /// state machine that `handle_invite` only starts.
    async fn handle_response(&self, resp: SipResponseEvent) {
        let Some((handle, idx)) = self.stack.find_by_cid(&resp.call_id) else {
            warn!(call_id = resp.call_id.as_str(), status = resp.status_code, "worker: response for unknown call");
            return;
        };

        match resp.status_code {
            180 => {
                let state = self.stack.with_call(handle, |c| c.state());
                let transitioned = match state {
                    Some(CallState::Trying) => self
                        .stack
                        .with_call(handle, |c| c.segment_ringing(idx))
                        .map(|r| r.is_ok())
                        .unwrap_or(false),
                    Some(CallState::Ringing) => self
                        .stack
                        .with_call(handle, |c| c.ringback())
                        .map(|r| r.is_ok())
                        .unwrap_or(false),
                    _ => false,
                };
                if transitioned {
                    self.forward_to_source(handle, 180, "Ringing").await;
                }
            }
            200 => {
                let cancels = self
                    .stack
                    .with_call(handle, |c| c.answer(idx))
                    .and_then(|r| r.ok());
                if let Some(cancels) = cancels {
                    self.forward_to_source(handle, 200, "OK").await;
                    for cancel in &cancels {
                        self.send_cancel(cancel).await;
                    }
                }
            }
            486 | 480 | 404 | 408 => {
                let busy = resp.status_code == 486;
                let resolved = self.stack.with_call(handle, |c| c.segment_failed(idx, busy)).flatten();
                match resolved {
                    Some(true) => {
                        self.stack.with_call(handle, |c| c.all_busy());
                        self.forward_to_source(handle, 486, "Busy Here").await;
                        self.stack.arm_reset_timer(call_handle_id(&self.stack, handle));
                    }
                    Some(false) => {
                        self.stack.with_call(handle, |c| c.unreachable());
                        self.forward_to_source(handle, 404, "Not Found").await;
                        self.stack.arm_reset_timer(call_handle_id(&self.stack, handle));
                    }
                    None => {}
                }
            }
            other => {
                info!(call_id = resp.call_id.as_str(), status = other, "worker: unhandled response status");
            }
        }
    }

    async fn forward_to_source(&self, handle: CallHandle, status_code: u16, reason: &str) {
        let Some((call_id, destination)) =
            self.stack.with_call(handle, |c| (c.source_cid(), c.source_addr()))
        else {
            return;
        };
        let message = OutboundMessage::Reply {
            status_code,
            reason: reason.to_string(),
            call_id,
            to_tag: None,
            contact: None,
            body: None,
            destination,
        };
        if let Err(e) = self.transport.send(message).await {
            warn!("worker: failed to forward {status_code} to source: {e}");
        }
    }

    async fn send_cancel(&self, cancel: &CancelTarget) {
        let Some(destination) = cancel.destination else { return };
        let message = OutboundMessage::Request {
            method: SipMethod::Cancel,
            request_uri: cancel.request_uri.clone(),
            call_id: cancel.cid.clone(),
            body: None,
            destination,
        };
        if let Err(e) = self.transport.send(message).await {
            warn!("worker: failed to send CANCEL for {}: {e}", cancel.cid);
        }
    }

    async fn send_reply(&self, req: &SipRequestEvent, (status, reason): (u16, String)) {
        let message = OutboundMessage::Reply {
            status_code: status,
            reason,
            call_id: req.call_id.clone(),
            to_tag: req.to_tag.clone(),
            contact: None,
            body: None,
            destination: req.source,
        };
        if let Err(e) = self.transport.send(message).await {
            warn!("worker: failed to send reply: {e}");
        }
    }
}

fn call_handle_id(stack: &Stack, handle: crate::stack::CallHandle) -> i64 {
    stack.with_call(handle, |c| c.id).unwrap_or(0)
}
