//! State shared by every connection.
//!
//! Built once by the daemon (or a test) and passed to the dispatcher as an
//! `Arc<Gateway>`. Nothing in the crate reaches for global state; anything a
//! request needs is reachable from here.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::crypt::{self, Crypter, CrypterFactory};
use crate::error::Result;
use crate::metadata::MetadataSource;
use crate::protocol::Setting;
use crate::session::SessionRegistry;
use crate::storage::{BackendFactory, ObjectStoreFactory, StorageBackend};
use crate::stream::{RateGovernor, RetryPolicy, RetryReader, StorageSource};

pub struct Gateway {
    pub config: GatewayConfig,
    pub storage: Arc<dyn StorageBackend>,
    pub metadata: Arc<dyn MetadataSource>,
    /// Local encryption key, if the deployment injected one.
    pub crypter: Option<Arc<dyn Crypter>>,
    /// Opens crypters for the source installation of a Copy.
    pub crypters: Option<Arc<dyn CrypterFactory>>,
    /// Opens the source backend of a Copy.
    pub backends: Arc<dyn BackendFactory>,
    pub governor: Arc<RateGovernor>,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        let governor = Arc::new(RateGovernor::from_config(&config.storage));
        Self {
            config,
            storage,
            metadata,
            crypter: None,
            crypters: None,
            backends: Arc::new(ObjectStoreFactory),
            governor,
            registry: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_crypter(mut self, crypter: Arc<dyn Crypter>) -> Self {
        self.crypter = Some(crypter);
        self
    }

    pub fn with_crypter_factory(mut self, factory: Arc<dyn CrypterFactory>) -> Self {
        self.crypters = Some(factory);
        self
    }

    pub fn with_backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.backends = factory;
        self
    }

    pub fn with_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.config.retry_limit,
            delay: self.config.retry_delay(),
        }
    }

    /// The local crypter, or `CrypterNotConfigured`.
    pub fn crypter(&self) -> Result<&Arc<dyn Crypter>> {
        crypt::require(self.crypter.as_ref())
    }

    /// Resilient reader over an object in `storage`.
    pub fn reader(
        &self,
        storage: Arc<dyn StorageBackend>,
        path: &str,
        settings: &[Setting],
    ) -> RetryReader<StorageSource> {
        RetryReader::new(
            StorageSource::new(storage, path, settings),
            self.retry_policy(),
            Arc::clone(&self.governor),
        )
    }
}
