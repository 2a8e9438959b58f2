//! chunkgw - object gateway for database backup chunks.
//!
//! Clients connect over a Unix socket and send one framed request per
//! connection: read, write, list, copy between installations, and the
//! retention operations (garbage collection, trash, obsolete sweeps).

pub mod client;
pub mod config;
pub mod crypt;
pub mod error;
pub mod gateway;
pub mod metadata;
pub mod protocol;
pub mod retention;
pub mod server;
pub mod session;
pub mod storage;
pub mod stream;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
