//! sipwitch-pbx — a SIP proxy and registrar core for small-to-mid PBX
//! deployments.
//!
//! Accepts REGISTER to bind users to contacts, routes
//! INVITE/MESSAGE/OPTIONS/BYE/CANCEL between registered and external
//! parties, and optionally coordinates an RTP media relay. See
//! [`engine::Engine`] for the top-level object that owns the registry,
//! call/session stack, worker pool, and background expirer.

pub mod arena;
pub mod auth;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod protocols;
pub mod registry;
pub mod stack;
pub mod transport;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
