//! SIP digest authentication (RFC 2617/3261), grounded on
//! `infrastructure/protocols/sip/auth.rs` in the `Ray-56-yakyak` example.
//!
//! Differs from that example in one respect: we never hold a plaintext
//! password, only the provisioned HA1 (`MD5(user:realm:pass)`) — the
//! digest is recomputed against the configured realm and the stored HA1.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Error;
use crate::Result;

const NONCE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: &'static str,
}

impl Challenge {
    pub fn to_header_value(&self) -> String {
        format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        )
    }
}

/// Parsed `Authorization`/`Proxy-Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl AuthorizationHeader {
    pub fn parse(value: &str) -> Result<Self> {
        let digest_str = value.strip_prefix("Digest ").unwrap_or(value).trim();
        let mut params: HashMap<String, String> = HashMap::new();
        for part in digest_str.split(',') {
            let part = part.trim();
            if let Some((key, val)) = part.split_once('=') {
                params.insert(key.trim().to_string(), val.trim().trim_matches('"').to_string());
            }
        }
        let get = |k: &str| {
            params
                .get(k)
                .cloned()
                .ok_or_else(|| Error::authentication(format!("missing {k} in Authorization header")))
        };
        Ok(Self {
            username: get("username")?,
            realm: get("realm")?,
            nonce: get("nonce")?,
            uri: get("uri")?,
            response: get("response")?,
        })
    }
}

/// Issues nonces and verifies responses against a per-user HA1. Holds no
/// user table itself — the registry is the source of truth for
/// credentials, this only manages the nonce lifecycle and the MD5 math.
pub struct DigestAuth {
    realm: String,
    nonces: Mutex<HashMap<String, Instant>>,
}

impl DigestAuth {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn challenge(&self) -> Challenge {
        let nonce = generate_nonce();
        self.nonces
            .lock()
            .expect("nonce table poisoned")
            .insert(nonce.clone(), Instant::now());
        Challenge {
            realm: self.realm.clone(),
            nonce,
            algorithm: "MD5",
        }
    }

    /// Verify `header` against the caller-supplied HA1, for the given
    /// request method. Consumes the nonce: a second use of the same
    /// nonce is rejected, forcing a fresh challenge per attempt.
    pub fn verify(&self, header: &AuthorizationHeader, ha1: &str, method: &str) -> Result<()> {
        {
            let mut nonces = self.nonces.lock().expect("nonce table poisoned");
            let issued = nonces
                .remove(&header.nonce)
                .ok_or_else(|| Error::authentication("unknown or reused nonce"))?;
            if issued.elapsed() > NONCE_TTL {
                return Err(Error::authentication("nonce expired"));
            }
        }
        if header.realm != self.realm {
            return Err(Error::authentication("realm mismatch"));
        }
        let expected = Self::response(ha1, &header.nonce, method, &header.uri);
        if expected != header.response {
            return Err(Error::authentication("digest response mismatch"));
        }
        Ok(())
    }

    fn response(ha1: &str, nonce: &str, method: &str, uri: &str) -> String {
        let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
        format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}")))
    }

    /// `HA1 = MD5(user:realm:pass)`, for provisioning a new credential.
    pub fn ha1(user: &str, realm: &str, pass: &str) -> String {
        format!("{:x}", md5::compute(format!("{user}:{realm}:{pass}")))
    }

    pub fn sweep_expired_nonces(&self) -> usize {
        let mut nonces = self.nonces.lock().expect("nonce table poisoned");
        let before = nonces.len();
        nonces.retain(|_, issued| issued.elapsed() <= NONCE_TTL);
        before - nonces.len()
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_response_verifies() {
        let auth = DigestAuth::new("sipwitch");
        let ha1 = DigestAuth::ha1("101", "sipwitch", "secret");
        let challenge = auth.challenge();
        let response = DigestAuth::response(&ha1, &challenge.nonce, "REGISTER", "sip:sipwitch");
        let header = AuthorizationHeader {
            username: "101".to_string(),
            realm: "sipwitch".to_string(),
            nonce: challenge.nonce,
            uri: "sip:sipwitch".to_string(),
            response,
        };
        assert!(auth.verify(&header, &ha1, "REGISTER").is_ok());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let auth = DigestAuth::new("sipwitch");
        let ha1 = DigestAuth::ha1("101", "sipwitch", "secret");
        let wrong_ha1 = DigestAuth::ha1("101", "sipwitch", "wrong");
        let challenge = auth.challenge();
        let response = DigestAuth::response(&wrong_ha1, &challenge.nonce, "REGISTER", "sip:sipwitch");
        let header = AuthorizationHeader {
            username: "101".to_string(),
            realm: "sipwitch".to_string(),
            nonce: challenge.nonce,
            uri: "sip:sipwitch".to_string(),
            response,
        };
        assert!(auth.verify(&header, &ha1, "REGISTER").is_err());
    }

    #[test]
    fn nonce_cannot_be_reused() {
        let auth = DigestAuth::new("sipwitch");
        let ha1 = DigestAuth::ha1("101", "sipwitch", "secret");
        let challenge = auth.challenge();
        let response = DigestAuth::response(&ha1, &challenge.nonce, "REGISTER", "sip:sipwitch");
        let header = AuthorizationHeader {
            username: "101".to_string(),
            realm: "sipwitch".to_string(),
            nonce: challenge.nonce,
            uri: "sip:sipwitch".to_string(),
            response,
        };
        assert!(auth.verify(&header, &ha1, "REGISTER").is_ok());
        assert!(auth.verify(&header, &ha1, "REGISTER").is_err());
    }

    #[test]
    fn parses_quoted_digest_header() {
        let value = r#"Digest username="101", realm="sipwitch", nonce="abc", uri="sip:x", response="def""#;
        let parsed = AuthorizationHeader::parse(value).unwrap();
        assert_eq!(parsed.username, "101");
        assert_eq!(parsed.nonce, "abc");
    }
}
