//! Catalog-backed metadata source.
//!
//! Reads the virtual index and expire hints from the database segment the
//! request targets (connecting to its port in utility mode), and takes the
//! backup checkpoint from the backup sentinels in storage.
//!
//! Connections are kept per `(port, database)` and reused until the server
//! closes them.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use super::{BackupCatalog, BackupCheckpoint, CatalogIndexes, Lsn, MetadataSource, SegmentRef};
use crate::config::MetadataConfig;

const VIRTUAL_INDEX: &str = "yezzey_virtual_index";
const EXPIRE_HINT: &str = "yezzey_expire_hint";

pub struct PostgresMetadata {
    config: MetadataConfig,
    backups: BackupCatalog,
    clients: Mutex<HashMap<(u16, String), Arc<Client>>>,
    /// Catalog database found on each port.
    databases: Mutex<HashMap<u16, String>>,
}

impl PostgresMetadata {
    pub fn new(config: MetadataConfig, backups: BackupCatalog) -> Self {
        Self {
            config,
            backups,
            clients: Mutex::new(HashMap::new()),
            databases: Mutex::new(HashMap::new()),
        }
    }

    async fn connect_to(&self, port: u16, dbname: &str) -> anyhow::Result<Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(port)
            .user(&self.config.user)
            .dbname(dbname)
            .options("-c gp_role=utility")
            .application_name("chunkgw");
        if let Some(password) = &self.config.password {
            pg.password(password);
        }

        let (client, conn) = pg
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to {dbname} on port {port}"))?;

        // The connection object performs the actual communication with the
        // database, so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::error!(error = ?e, "postgres connection error: {e}");
            }
        });

        Ok(client)
    }

    async fn connect(&self, segment: &SegmentRef) -> anyhow::Result<Arc<Client>> {
        let port = u16::try_from(segment.port)
            .with_context(|| format!("Invalid segment port {}", segment.port))?;

        let db = match segment.database.as_ref().or(self.config.database.as_ref()) {
            Some(db) => db.clone(),
            None => self.catalog_database(port).await?,
        };

        let mut clients = self.clients.lock().await;
        let key = (port, db);
        if let Some(client) = clients.get(&key) {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            tracing::debug!(port, db = %key.1, "postgres connection closed, reconnecting");
        }
        let client = Arc::new(self.connect_to(port, &key.1).await?);
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    async fn catalog_database(&self, port: u16) -> anyhow::Result<String> {
        let mut databases = self.databases.lock().await;
        if let Some(db) = databases.get(&port) {
            return Ok(db.clone());
        }
        let db = self.discover_database(port).await?;
        databases.insert(port, db.clone());
        Ok(db)
    }

    /// Find the database carrying the catalog schema.
    async fn discover_database(&self, port: u16) -> anyhow::Result<String> {
        let client = self.connect_to(port, "postgres").await?;
        let rows = client
            .query(
                "SELECT datname FROM pg_database WHERE datallowconn AND NOT datistemplate",
                &[],
            )
            .await
            .context("Failed to list databases")?;

        for row in rows {
            let dbname: String = row.try_get(0)?;
            let candidate = self.connect_to(port, &dbname).await?;
            let has_schema: bool = candidate
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                    &[&self.config.catalog_schema],
                )
                .await?
                .try_get(0)?;
            if has_schema {
                tracing::debug!("Found catalog schema in database {}", dbname);
                return Ok(dbname);
            }
        }

        anyhow::bail!(
            "no database on port {port} has schema {}",
            self.config.catalog_schema
        )
    }

    fn table(&self, name: &str) -> String {
        format!(
            "\"{}\".{}",
            self.config.catalog_schema.replace('"', "\"\""),
            name
        )
    }

    /// One statement, so both indexes come from the same snapshot.
    fn indexes_sql(&self) -> String {
        format!(
            "SELECT 'v', x_path, NULL::text FROM {} \
             UNION ALL SELECT 'e', x_path, expire_lsn::text FROM {}",
            self.table(VIRTUAL_INDEX),
            self.table(EXPIRE_HINT)
        )
    }

    /// Hints are stored in the catalog's slash-prefixed form.
    fn add_hint_sql(&self) -> String {
        format!(
            "INSERT INTO {} (x_path, expire_lsn) VALUES ('/' || $1, $2::text::pg_lsn)",
            self.table(EXPIRE_HINT)
        )
    }

    fn delete_hint_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE x_path = '/' || $1 OR x_path = $1",
            self.table(EXPIRE_HINT)
        )
    }
}

/// Fold `(kind, path, lsn)` rows of [`PostgresMetadata::indexes_sql`].
fn fold_indexes<'a>(
    rows: impl IntoIterator<Item = (&'a str, &'a str, Option<&'a str>)>,
) -> anyhow::Result<CatalogIndexes> {
    let mut indexes = CatalogIndexes::default();
    for (kind, path, lsn) in rows {
        match (kind, lsn) {
            ("v", _) => {
                indexes.live.insert(normalize(path));
            }
            ("e", Some(lsn)) => {
                indexes.expire.insert(normalize(path), lsn.parse()?);
            }
            _ => anyhow::bail!("unexpected index row ({kind}, {path}, {lsn:?})"),
        }
    }
    Ok(indexes)
}

/// Catalog paths may carry a leading slash; object paths never do.
fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl MetadataSource for PostgresMetadata {
    async fn virtual_index(&self, segment: &SegmentRef) -> anyhow::Result<HashSet<String>> {
        let client = self.connect(segment).await?;
        let sql = format!("SELECT x_path FROM {}", self.table(VIRTUAL_INDEX));
        let rows = client
            .query(sql.as_str(), &[])
            .await
            .context("Failed to read virtual index")?;

        rows.iter()
            .map(|row| -> anyhow::Result<String> { Ok(normalize(row.try_get::<_, &str>(0)?)) })
            .collect()
    }

    async fn expire_index(&self, segment: &SegmentRef) -> anyhow::Result<HashMap<String, Lsn>> {
        let client = self.connect(segment).await?;
        let sql = format!(
            "SELECT x_path, expire_lsn::text FROM {}",
            self.table(EXPIRE_HINT)
        );
        let rows = client
            .query(sql.as_str(), &[])
            .await
            .context("Failed to read expire index")?;

        let mut index = HashMap::with_capacity(rows.len());
        for row in rows {
            let path: &str = row.try_get(0)?;
            let lsn: &str = row.try_get(1)?;
            index.insert(normalize(path), lsn.parse()?);
        }
        Ok(index)
    }

    async fn indexes(&self, segment: &SegmentRef) -> anyhow::Result<CatalogIndexes> {
        let client = self.connect(segment).await?;
        let rows = client
            .query(self.indexes_sql().as_str(), &[])
            .await
            .context("Failed to read virtual and expire indexes")?;

        let rows = rows
            .iter()
            .map(|row| -> anyhow::Result<(&str, &str, Option<&str>)> {
                Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        fold_indexes(rows)
    }

    async fn first_backup_lsn(&self, segment: &SegmentRef) -> anyhow::Result<BackupCheckpoint> {
        self.backups.first_backup_lsn(segment.segnum).await
    }

    async fn current_lsn(&self, segment: &SegmentRef) -> anyhow::Result<Lsn> {
        let client = self.connect(segment).await?;
        let row = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .context("Failed to read current LSN")?;
        let lsn: &str = row.try_get(0)?;
        lsn.parse()
    }

    async fn add_expire_hint(
        &self,
        segment: &SegmentRef,
        path: &str,
        lsn: Lsn,
    ) -> anyhow::Result<()> {
        let client = self.connect(segment).await?;
        let path = normalize(path);
        client
            .execute(self.add_hint_sql().as_str(), &[&path, &lsn.to_string()])
            .await
            .with_context(|| format!("Failed to add expire hint for {path}"))?;
        Ok(())
    }

    async fn delete_expire_hint(&self, segment: &SegmentRef, path: &str) -> anyhow::Result<()> {
        let client = self.connect(segment).await?;
        let path = normalize(path);
        client
            .execute(self.delete_hint_sql().as_str(), &[&path])
            .await
            .with_context(|| format!("Failed to delete expire hint for {path}"))?;
        Ok(())
    }
}
