//! `object_store`-backed storage: local filesystem, S3, and the in-memory
//! store used by tests.

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::{Attribute, Attributes, GetOptions, GetRange, ObjectStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;

use super::{
    BoxAsyncRead, BoxAsyncWrite, MultipartUpload, ObjectInfo, ServerSideCopyError, StorageBackend,
};
use crate::config::{StorageConfig, StorageType};
use crate::protocol::{
    find_setting, Setting, SETTING_MULTIPART_CHUNK_SIZE, SETTING_MULTIPART_UPLOAD,
    SETTING_STORAGE_CLASS, SETTING_TABLESPACE,
};

/// Tablespace served by the main bucket.
pub const DEFAULT_TABLESPACE: &str = "pg_default";

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    /// Key prefix inside the store, without trailing slash. Empty for `fs`,
    /// where the root directory is handled by `LocalFileSystem` itself.
    key_root: String,
    config: StorageConfig,
    /// Stores for non-default tablespaces. `None` ignores the `Tablespace`
    /// setting altogether.
    tablespaces: Option<HashMap<String, Arc<dyn ObjectStore>>>,
    /// `LocalFileSystem` refuses writes that carry attributes.
    attributes: bool,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, key_root: &str, config: StorageConfig) -> Self {
        Self {
            store,
            key_root: key_root.trim_matches('/').to_string(),
            config,
            tablespaces: None,
            attributes: true,
        }
    }

    /// Route requests naming `tablespace` to `store`. Once any tablespace is
    /// registered, requests naming an unknown one fail.
    pub fn with_tablespace(mut self, tablespace: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.tablespaces
            .get_or_insert_with(HashMap::new)
            .insert(tablespace.to_string(), store);
        self
    }

    pub fn from_config(config: &StorageConfig) -> anyhow::Result<Self> {
        match config.storage_type {
            StorageType::Fs => {
                std::fs::create_dir_all(&config.storage_prefix).with_context(|| {
                    format!("Failed to create storage root {}", config.storage_prefix)
                })?;
                let store = LocalFileSystem::new_with_prefix(&config.storage_prefix)
                    .with_context(|| format!("Invalid storage root {}", config.storage_prefix))?;
                tracing::info!("Using fs root '{}' as storage", config.storage_prefix);
                Ok(Self {
                    attributes: false,
                    ..Self::new(Arc::new(store), "", config.clone())
                })
            }
            StorageType::S3 => Self::s3(config),
        }
    }

    #[cfg(feature = "s3")]
    fn s3(config: &StorageConfig) -> anyhow::Result<Self> {
        let store = Self::s3_bucket(config, &config.storage_bucket)?;
        tracing::info!(
            "Using s3 bucket '{}' as storage, prefix in bucket: '{}', endpoint: '{:?}'",
            config.storage_bucket,
            config.storage_prefix,
            config.storage_endpoint
        );

        let mut backend = Self::new(store, &config.storage_prefix, config.clone());
        backend.tablespaces = Some(HashMap::new());
        for (tablespace, bucket) in &config.tablespace_map {
            tracing::info!("Tablespace '{}' is stored in bucket '{}'", tablespace, bucket);
            backend = backend.with_tablespace(tablespace, Self::s3_bucket(config, bucket)?);
        }
        Ok(backend)
    }

    #[cfg(feature = "s3")]
    fn s3_bucket(config: &StorageConfig, bucket: &str) -> anyhow::Result<Arc<dyn ObjectStore>> {
        use object_store::aws::AmazonS3Builder;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = &config.storage_region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.storage_endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        let store = builder
            .build()
            .with_context(|| format!("Failed to configure bucket {bucket}"))?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "s3"))]
    fn s3(_config: &StorageConfig) -> anyhow::Result<Self> {
        anyhow::bail!("s3 storage requested but chunkgw was built without the `s3` feature")
    }

    fn store_for(&self, settings: &[Setting]) -> anyhow::Result<&Arc<dyn ObjectStore>> {
        let Some(tablespaces) = &self.tablespaces else {
            return Ok(&self.store);
        };
        match find_setting(settings, SETTING_TABLESPACE) {
            None | Some("") | Some(DEFAULT_TABLESPACE) => Ok(&self.store),
            Some(tablespace) => tablespaces.get(tablespace).ok_or_else(|| {
                anyhow::anyhow!("failed to match tablespace {tablespace} to a bucket")
            }),
        }
    }

    fn key(&self, path: &str) -> StorePath {
        StorePath::from(join_key(&self.key_root, path).as_str())
    }

    fn relative<'a>(&self, location: &'a StorePath) -> Option<&'a str> {
        let full: &str = location.as_ref();
        if self.key_root.is_empty() {
            return Some(full);
        }
        full.strip_prefix(self.key_root.as_str())?.strip_prefix('/')
    }

    /// Key root the source installation uses inside a shared store.
    fn source_root(source: &StorageConfig) -> &str {
        match source.storage_type {
            StorageType::Fs => "",
            StorageType::S3 => source.storage_prefix.trim_matches('/'),
        }
    }
}

/// `MultipartUpload` values that ask for a single PUT.
fn multipart_disabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn join_key(root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn read(
        &self,
        path: &str,
        offset: u64,
        settings: &[Setting],
    ) -> anyhow::Result<BoxAsyncRead> {
        let store = self.store_for(settings)?;
        let location = self.key(path);

        let options = if offset == 0 {
            GetOptions::default()
        } else {
            // A range starting at the end is rejected by the store, but is a
            // legitimate resume point after the last byte was consumed.
            let size = store
                .head(&location)
                .await
                .with_context(|| format!("Failed to stat {path}"))?
                .size;
            if offset >= size {
                return Ok(Box::new(tokio::io::empty()));
            }
            GetOptions {
                range: Some(GetRange::Offset(offset)),
                ..Default::default()
            }
        };

        let result = store
            .get_opts(&location, options)
            .await
            .with_context(|| format!("Failed to open {path} at offset {offset}"))?;

        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write(&self, path: &str, settings: &[Setting]) -> anyhow::Result<BoxAsyncWrite> {
        let store = Arc::clone(self.store_for(settings)?);
        let location = self.key(path);

        let single_put = find_setting(settings, SETTING_MULTIPART_UPLOAD)
            .is_some_and(multipart_disabled);
        let chunk = find_setting(settings, SETTING_MULTIPART_CHUNK_SIZE)
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|chunk| *chunk > 0);
        let writer = match (single_put, chunk) {
            // Never crosses the capacity, so the whole object goes up in
            // one PUT on shutdown.
            (true, _) => BufWriter::with_capacity(store, location, usize::MAX),
            (false, Some(chunk)) => BufWriter::with_capacity(store, location, chunk),
            (false, None) => BufWriter::new(store, location),
        };

        let writer = match find_setting(settings, SETTING_STORAGE_CLASS) {
            Some(class) if self.attributes && !class.is_empty() => {
                let mut attributes = Attributes::new();
                attributes.insert(Attribute::StorageClass, class.to_string().into());
                writer.with_attributes(attributes)
            }
            _ => writer,
        };
        Ok(Box::new(writer))
    }

    async fn list(&self, prefix: &str, settings: &[Setting]) -> anyhow::Result<Vec<ObjectInfo>> {
        let store = self.store_for(settings)?;
        // The store lists whole path segments; narrow to the parent
        // directory and filter by string prefix.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let base = join_key(&self.key_root, dir);
        let list_prefix = (!base.is_empty()).then(|| StorePath::from(base.as_str()));

        let metas: Vec<_> = store
            .list(list_prefix.as_ref())
            .try_collect()
            .await
            .with_context(|| format!("Failed to list {prefix}"))?;

        let prefix = prefix.trim_start_matches('/');
        let mut objects: Vec<ObjectInfo> = metas
            .iter()
            .filter_map(|meta| {
                let rel = self.relative(&meta.location)?;
                rel.starts_with(prefix)
                    .then(|| ObjectInfo::new(rel, meta.size))
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::debug!("Listed {} objects under '{}'", objects.len(), prefix);
        Ok(objects)
    }

    async fn move_object(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.store
            .rename(&self.key(from), &self.key(to))
            .await
            .with_context(|| format!("Failed to move {from} to {to}"))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.store
            .delete(&self.key(path))
            .await
            .with_context(|| format!("Failed to delete {path}"))
    }

    async fn copy_server_side(
        &self,
        source: &StorageConfig,
        from: &str,
        to: &str,
    ) -> Result<(), ServerSideCopyError> {
        if !self.config.same_store(source) {
            return Err(ServerSideCopyError::Unsupported(
                "source and destination are different stores".to_string(),
            ));
        }
        let from_key = StorePath::from(join_key(Self::source_root(source), from).as_str());
        self.store
            .copy(&from_key, &self.key(to))
            .await
            .with_context(|| format!("Failed to copy {from} to {to}"))?;
        Ok(())
    }

    async fn list_failed_multipart_uploads(&self) -> anyhow::Result<Vec<MultipartUpload>> {
        // object_store does not expose pending uploads.
        Ok(Vec::new())
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> anyhow::Result<()> {
        anyhow::bail!(
            "cannot abort upload {} of {}: not supported by this backend",
            upload.upload_id,
            upload.path
        )
    }
}
