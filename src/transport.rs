//! The SIP wire layer: a `Transport` trait exposing a `poll_event`-style
//! API at the external-interface boundary, plus a concrete UDP
//! implementation built on `rsip` for message parsing (grounded on
//! `infrastructure/protocols/sip/message.rs` in `Ray-56-yakyak`) and
//! `tokio::net::UdpSocket` for I/O.
//!
//! The message parser/transport itself is explicitly out of scope for
//! the core — this module is the thin seam the worker/stack code is
//! written against, so a different transport (TCP, TLS, a test double)
//! only needs a new `Transport` impl.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rsip::{Header, Request, Response, SipMessage as RsipMessage};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SipConfig;
use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Message,
    Info,
    Notify,
    Subscribe,
    Refer,
    Other,
}

impl SipMethod {
    fn from_rsip(method: &rsip::Method) -> Self {
        use rsip::Method::*;
        match method {
            Register => Self::Register,
            Invite => Self::Invite,
            Ack => Self::Ack,
            Cancel => Self::Cancel,
            Bye => Self::Bye,
            Options => Self::Options,
            Message => Self::Message,
            Info => Self::Info,
            Notify => Self::Notify,
            Subscribe => Self::Subscribe,
            Refer => Self::Refer,
            _ => Self::Other,
        }
    }
}

/// A parsed inbound request, trimmed to the fields the worker cascade
/// needs (identify/classify/authenticate/authorize/dispatch).
#[derive(Debug, Clone)]
pub struct SipRequestEvent {
    pub method: SipMethod,
    pub call_id: String,
    pub from_uri: String,
    pub from_tag: Option<String>,
    pub to_uri: String,
    pub to_tag: Option<String>,
    pub request_uri: String,
    pub cseq: u32,
    pub contact: Option<String>,
    pub expires: Option<u32>,
    pub authorization: Option<String>,
    pub body: String,
    pub source: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct SipResponseEvent {
    pub status_code: u16,
    pub call_id: String,
    pub cseq: u32,
    pub to_tag: Option<String>,
    pub body: String,
    pub source: SocketAddr,
}

/// Events a worker pulls off the transport's queue, matching §2's "SIP
/// event loop ... dispatches events to workers".
#[derive(Debug, Clone)]
pub enum SipEvent {
    Request(SipRequestEvent),
    Response(SipResponseEvent),
    TransactionTimeout { call_id: String },
}

/// An outbound message the worker hands back after releasing the call
/// mutex — never constructed and sent while holding it.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Reply {
        status_code: u16,
        reason: String,
        call_id: String,
        to_tag: Option<String>,
        contact: Option<String>,
        body: Option<String>,
        destination: SocketAddr,
    },
    Request {
        method: SipMethod,
        request_uri: String,
        call_id: String,
        body: Option<String>,
        destination: SocketAddr,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn event_wait(&self) -> Result<SipEvent>;
    async fn send(&self, message: OutboundMessage) -> Result<()>;
    /// Retransmits / transaction-timeout sweep, called once per
    /// background-thread wake per §4.5.
    async fn automatic_action(&self);
    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    agent: String,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SipEvent>>,
}

impl UdpTransport {
    pub async fn bind(config: &SipConfig) -> Result<Self> {
        let interface = config.interface.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let addr = format!("{interface}:{}", config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| Error::fatal(format!("failed to bind SIP transport on {addr}: {e}")))?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::unbounded_channel();
        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        if let Some(event) = parse_datagram(&buf[..len], source) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("transport: recv_from failed: {e}");
                    }
                }
            }
        });

        Ok(Self {
            socket,
            agent: config.agent.clone(),
            inbound_rx: tokio::sync::Mutex::new(rx),
        })
    }
}

fn parse_datagram(data: &[u8], source: SocketAddr) -> Option<SipEvent> {
    match RsipMessage::try_from(data.to_vec()) {
        Ok(RsipMessage::Request(req)) => Some(SipEvent::Request(request_event(&req, source))),
        Ok(RsipMessage::Response(resp)) => Some(SipEvent::Response(response_event(&resp, source))),
        Err(e) => {
            debug!("transport: failed to parse datagram from {source}: {e}");
            None
        }
    }
}

fn header_string(headers: &rsip::Headers, pick: impl Fn(&Header) -> Option<String>) -> Option<String> {
    headers.iter().find_map(pick)
}

fn request_event(req: &Request, source: SocketAddr) -> SipRequestEvent {
    let call_id = header_string(&req.headers, |h| match h {
        Header::CallId(v) => Some(v.to_string()),
        _ => None,
    })
    .unwrap_or_default();

    let from_raw = header_string(&req.headers, |h| match h {
        Header::From(v) => Some(v.to_string()),
        _ => None,
    })
    .unwrap_or_default();
    let to_raw = header_string(&req.headers, |h| match h {
        Header::To(v) => Some(v.to_string()),
        _ => None,
    })
    .unwrap_or_default();

    let cseq = header_string(&req.headers, |h| match h {
        Header::CSeq(v) => Some(v.to_string()),
        _ => None,
    })
    .and_then(|s| s.split_whitespace().next().map(|n| n.to_string()))
    .and_then(|n| n.parse().ok())
    .unwrap_or(0);

    let contact = header_string(&req.headers, |h| match h {
        Header::Contact(v) => Some(v.to_string()),
        _ => None,
    });

    let expires = header_string(&req.headers, |h| match h {
        Header::Expires(v) => Some(v.to_string()),
        _ => None,
    })
    .and_then(|s| s.parse().ok());

    let authorization = header_string(&req.headers, |h| match h {
        Header::Authorization(v) => Some(v.to_string()),
        _ => None,
    });

    SipRequestEvent {
        method: SipMethod::from_rsip(&req.method),
        call_id,
        from_uri: extract_uri(&from_raw),
        from_tag: extract_tag(&from_raw),
        to_uri: extract_uri(&to_raw),
        to_tag: extract_tag(&to_raw),
        request_uri: req.uri.to_string(),
        cseq,
        contact,
        expires,
        authorization,
        body: String::from_utf8_lossy(&req.body).to_string(),
        source,
    }
}

fn response_event(resp: &Response, source: SocketAddr) -> SipResponseEvent {
    let call_id = header_string(&resp.headers, |h| match h {
        Header::CallId(v) => Some(v.to_string()),
        _ => None,
    })
    .unwrap_or_default();
    let to_raw = header_string(&resp.headers, |h| match h {
        Header::To(v) => Some(v.to_string()),
        _ => None,
    })
    .unwrap_or_default();
    let cseq = header_string(&resp.headers, |h| match h {
        Header::CSeq(v) => Some(v.to_string()),
        _ => None,
    })
    .and_then(|s| s.split_whitespace().next().map(|n| n.to_string()))
    .and_then(|n| n.parse().ok())
    .unwrap_or(0);

    SipResponseEvent {
        status_code: resp.status_code.clone().into(),
        call_id,
        cseq,
        to_tag: extract_tag(&to_raw),
        body: String::from_utf8_lossy(&resp.body).to_string(),
        source,
    }
}

fn extract_uri(header_value: &str) -> String {
    header_value
        .split(['<', '>'])
        .nth(1)
        .unwrap_or(header_value)
        .split(';')
        .next()
        .unwrap_or(header_value)
        .trim()
        .to_string()
}

fn extract_tag(header_value: &str) -> Option<String> {
    header_value
        .split(';')
        .find_map(|p| p.trim().strip_prefix("tag=").map(|t| t.to_string()))
}

#[async_trait]
impl Transport for UdpTransport {
    async fn event_wait(&self) -> Result<SipEvent> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::transient("transport receive channel closed"))
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let (text, destination) = match message {
            OutboundMessage::Reply {
                status_code,
                reason,
                call_id,
                to_tag,
                contact,
                body,
                destination,
            } => {
                let tag_suffix = to_tag.map(|t| format!(";tag={t}")).unwrap_or_default();
                let contact_line = contact
                    .map(|c| format!("Contact: {c}\r\n"))
                    .unwrap_or_default();
                let body = body.unwrap_or_default();
                (
                    format!(
                        "SIP/2.0 {status_code} {reason}\r\nCall-ID: {call_id}\r\n{contact_line}Content-Length: {}\r\n\r\n{body}",
                        body.len()
                    ),
                    destination,
                )
            }
            OutboundMessage::Request {
                method,
                request_uri,
                call_id,
                body,
                destination,
            } => {
                let body = body.unwrap_or_default();
                (
                    format!(
                        "{:?} {request_uri} SIP/2.0\r\nCall-ID: {call_id}\r\nUser-Agent: {}\r\nContent-Length: {}\r\n\r\n{body}",
                        method,
                        self.agent,
                        body.len()
                    ),
                    destination,
                )
            }
        };
        self.socket
            .send_to(text.as_bytes(), destination)
            .await
            .map_err(|e| Error::transient(format!("send failed: {e}")))?;
        Ok(())
    }

    async fn automatic_action(&self) {
        // Retransmit/timeout handling lives at the transaction layer the
        // spec treats as an external library; the UDP socket here has no
        // retained transaction state to sweep.
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_uri_strips_display_name_and_params() {
        let value = r#""Alice" <sip:101@example.com>;tag=abc123"#;
        assert_eq!(extract_uri(value), "sip:101@example.com");
    }

    #[test]
    fn extract_tag_finds_tag_param() {
        let value = r#"<sip:101@example.com>;tag=abc123"#;
        assert_eq!(extract_tag(value), Some("abc123".to_string()));
    }

    #[test]
    fn extract_tag_absent_returns_none() {
        let value = "<sip:101@example.com>";
        assert_eq!(extract_tag(value), None);
    }
}
