//! Configuration management for the PBX core.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbxConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub registry: RegistryConfig,
    pub stack: StackConfig,
    pub rtp: RtpConfig,
    pub acl: AclConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub interface: Option<String>,
    pub port: u16,
    pub family: IpFamily,
    pub transport: SipTransport,
    pub agent: String,
    pub domain: String,
    /// Send a provisional 100 Trying before resolving the destination.
    pub send_trying: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    Ipv4,
    #[serde(rename = "ipv6")]
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SipTransport {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tls")]
    Tls,
}

/// Registry sizing, expiry clamps, and the digest realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Number of buckets in the id-hash (spec default: 177).
    pub keysize: usize,
    /// Pre-reserved entry count; 0 means "derive from provisioning".
    pub mapped: usize,
    pub realm: String,
    /// MD5 digest algorithm name, kept configurable for forward
    /// compatibility even though MD5 is the only one implemented.
    pub digest: String,
    pub min_expires: u32,
    pub max_expires: u32,
    pub default_expires: u32,
    /// Extension numbering range: valid extensions are
    /// `[prefix, prefix + range)`.
    pub extension_prefix: u32,
    pub extension_range: u32,
    /// How long an offline MESSAGE is held before it is dropped unread.
    pub message_ttl_s: i64,
}

/// Arena sizing, worker pool, and call/session timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub worker_threads: usize,
    /// Background expirer wake interval, milliseconds.
    pub timing_ms: u64,
    pub ring_timer_ms: u64,
    pub cfna_timer_ms: u64,
    pub reset_timer_ms: u64,
    pub invite_expires_s: u64,
    /// Safety-net timer for calls that never leave INITIAL.
    pub initial_timeout_ms: u64,
    /// Arena capacity: 0 means unbounded (bounded only by host memory).
    pub max_calls: usize,
    pub max_segments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    pub enabled: bool,
    pub port_min: u16,
    pub port_max: u16,
}

/// Access control: which source addresses are trusted without
/// authentication, which are refused outright, and which local names the
/// worker treats as referring to this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclConfig {
    pub trusted: Vec<String>,
    pub restricted: Vec<String>,
    pub localnames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Path of the control fifo. `None` disables the control channel.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl PbxConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PbxConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("PBX").separator("_"))
            .build()?;
        let pbx_config = settings.try_deserialize()?;
        Ok(pbx_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.min_expires == 0 || self.registry.min_expires > self.registry.max_expires
        {
            return Err(Error::parse("Invalid registry expiry clamp range"));
        }
        if self.registry.keysize == 0 {
            return Err(Error::parse("Registry keysize must be nonzero"));
        }
        if self.rtp.enabled && self.rtp.port_min >= self.rtp.port_max {
            return Err(Error::parse("Invalid RTP port range"));
        }
        if self.stack.worker_threads == 0 {
            return Err(Error::parse("At least one worker thread is required"));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "pbx-1".to_string(),
                description: "Sipwitch PBX core".to_string(),
                user: None,
            },
            sip: SipConfig {
                interface: None,
                port: 5060,
                family: IpFamily::Ipv4,
                transport: SipTransport::Udp,
                agent: "sipwitch-pbx".to_string(),
                domain: "localhost".to_string(),
                send_trying: true,
            },
            registry: RegistryConfig {
                keysize: 177,
                mapped: 0,
                realm: "sipwitch".to_string(),
                digest: "MD5".to_string(),
                min_expires: 60,
                max_expires: 3600,
                default_expires: 300,
                extension_prefix: 100,
                extension_range: 900,
                message_ttl_s: 86_400,
            },
            stack: StackConfig {
                worker_threads: 2,
                timing_ms: 500,
                ring_timer_ms: 4_000,
                cfna_timer_ms: 16_000,
                reset_timer_ms: 6_000,
                invite_expires_s: 120,
                initial_timeout_ms: 7_000,
                max_calls: 0,
                max_segments: 0,
            },
            rtp: RtpConfig {
                enabled: false,
                port_min: 10_000,
                port_max: 20_000,
            },
            acl: AclConfig {
                trusted: Vec::new(),
                restricted: Vec::new(),
                localnames: vec![
                    "localhost".to_string(),
                    "localhost.localdomain".to_string(),
                ],
            },
            control: ControlConfig {
                path: Some("/tmp/sipwitch-pbx/control".to_string()),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                format: LogFormat::Compact,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = PbxConfig::default_config();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_expiry_clamp() {
        let mut cfg = PbxConfig::default_config();
        cfg.registry.min_expires = 3600;
        cfg.registry.max_expires = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_keysize() {
        let mut cfg = PbxConfig::default_config();
        cfg.registry.keysize = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = PbxConfig::default_config();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: PbxConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sip.port, cfg.sip.port);
    }
}
