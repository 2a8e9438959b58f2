// Encryption capability.
//
// The gateway never implements a cipher itself: deployments inject a Crypter
// when they construct the server. Operations that need one and find none fail
// with `GatewayError::CrypterNotConfigured`.

use std::sync::Arc;

use crate::config::CryptoConfig;
use crate::error::{GatewayError, Result};
use crate::storage::{BoxAsyncRead, BoxAsyncWrite};

/// Key version reported to clients after an encrypted write.
pub const DEFAULT_KEY_VERSION: u16 = 1;

pub trait Crypter: Send + Sync {
    /// Wrap `sink` so plaintext written to the result lands encrypted in it.
    /// Shutting down the returned writer must flush and shut down `sink`.
    fn encrypt(&self, sink: BoxAsyncWrite) -> anyhow::Result<BoxAsyncWrite>;

    /// Wrap `source` so reading the result yields plaintext.
    fn decrypt(&self, source: BoxAsyncRead) -> anyhow::Result<BoxAsyncRead>;

    /// Whether `other` references the same key material as this crypter.
    fn key_matches(&self, other: &CryptoConfig) -> bool;

    fn key_version(&self) -> u16 {
        DEFAULT_KEY_VERSION
    }
}

/// Builds crypters from key references; a Copy needs one for the source
/// installation as well as the local one.
pub trait CrypterFactory: Send + Sync {
    fn open(&self, config: &CryptoConfig) -> anyhow::Result<Arc<dyn Crypter>>;
}

/// Fetch the configured crypter or fail the operation.
pub fn require(crypter: Option<&Arc<dyn Crypter>>) -> Result<&Arc<dyn Crypter>> {
    crypter.ok_or(GatewayError::CrypterNotConfigured)
}

/// Source and destination keys are equivalent when both are absent or both
/// are present and reference the same key.
pub fn keys_equivalent(local: Option<&Arc<dyn Crypter>>, source: Option<&CryptoConfig>) -> bool {
    match (local, source) {
        (None, None) => true,
        (Some(crypter), Some(config)) => crypter.key_matches(config),
        _ => false,
    }
}
