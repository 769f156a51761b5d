//! Stratum proxy that relays miners to a pool, redirects hashrate to other
//! pools for bounded windows, and independently validates submitted shares.

pub mod config;
pub mod error;
pub mod relay;
pub mod stratum_v1;
pub mod tcp_server;
pub mod tracing;
pub mod types;
pub mod validator;

pub use error::{Error, Result};
