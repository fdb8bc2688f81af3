//! KV store adapter: serialised responses with adjacent metadata.
//!
//! Three namespaces (artifacts, versions, fallback) share one backend,
//! separated by key prefix. The Redis implementation stores the value at
//! `<key>` and the metadata JSON at `<key>#meta` with the same TTL; the
//! in-memory implementation keeps them in one record. The placement is not
//! observable externally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::KvConfig;
use crate::error::StorageError;
use crate::routing::normalize_path;

const META_SUFFIX: &str = "#meta";

/// Metadata persisted adjacent to each artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheMetadata {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub etag: Option<String>,
    pub cache_tags: Vec<String>,
    pub cache_version: u32,
}

impl CacheMetadata {
    #[must_use]
    pub fn new(
        content_type: Option<String>,
        content_length: u64,
        ttl_seconds: u64,
        cache_tags: Vec<String>,
        cache_version: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
            ttl_seconds,
            content_type,
            content_length,
            etag: None,
            cache_tags,
            cache_version,
        }
    }
}

/// A stored value with its optional metadata.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub body: Bytes,
    pub metadata: Option<CacheMetadata>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError>;

    /// Store `body` (and metadata, when given) under `key`.
    ///
    /// Bodies larger than the adapter limit are rejected with
    /// [`StorageError::ValueTooLarge`]. When metadata is present its
    /// `content_length` must equal `body.len()`.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Option<CacheMetadata>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

fn check_put(
    body: &Bytes,
    metadata: Option<&CacheMetadata>,
    limit: usize,
) -> Result<(), StorageError> {
    if body.len() > limit {
        return Err(StorageError::ValueTooLarge {
            size: body.len(),
            limit,
        });
    }
    if let Some(meta) = metadata {
        if meta.content_length != body.len() as u64 {
            return Err(StorageError::Serialization(format!(
                "content_length {} does not match body length {}",
                meta.content_length,
                body.len()
            )));
        }
    }
    Ok(())
}

/// The three persisted namespaces.
#[derive(Clone)]
pub struct KvNamespaces {
    pub artifacts: Arc<dyn KvStore>,
    pub versions: Arc<dyn KvStore>,
    pub fallback: Arc<dyn KvStore>,
}

impl KvNamespaces {
    /// In-memory namespaces for tests and single-node use.
    #[must_use]
    pub fn in_memory(max_value_bytes: usize) -> Self {
        Self {
            artifacts: Arc::new(MemoryKvStore::new(max_value_bytes)),
            versions: Arc::new(MemoryKvStore::new(max_value_bytes)),
            fallback: Arc::new(MemoryKvStore::new(max_value_bytes)),
        }
    }

    /// Redis-backed namespaces, prefix-separated.
    pub async fn connect(config: &KvConfig) -> Result<Self, StorageError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StorageError::Backend("kv.url is not configured".to_string()))?;
        let client = redis::Client::open(url).map_err(StorageError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(StorageError::from)?;
        let op_timeout = Duration::from_secs(config.op_timeout_seconds);

        let store = |namespace: &str| -> Arc<dyn KvStore> {
            Arc::new(RedisKvStore {
                conn: conn.clone(),
                prefix: format!("{}:{}:", config.key_prefix, namespace),
                max_value_bytes: config.max_value_bytes,
                op_timeout,
            })
        };

        Ok(Self {
            artifacts: store("artifacts"),
            versions: store("versions"),
            fallback: store("fallback"),
        })
    }

    /// Every artifact key whose base path component equals `base_path`,
    /// regardless of derivative or version.
    pub async fn list_variants(&self, base_path: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("video:{}:", normalize_path(base_path));
        self.artifacts.list(&prefix).await
    }
}

// ------------------------------------------------------------------
// In-memory implementation
// ------------------------------------------------------------------

struct StoredRecord {
    body: Bytes,
    metadata: Option<CacheMetadata>,
    expires_at: Option<std::time::Instant>,
}

/// In-memory `KvStore`. Used by tests and single-node deployments without
/// a Redis URL.
pub struct MemoryKvStore {
    records: RwLock<HashMap<String, StoredRecord>>,
    max_value_bytes: usize,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new(max_value_bytes: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_value_bytes,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError> {
        let records = self.records.read();
        match records.get(key) {
            Some(record) => {
                if let Some(expires_at) = record.expires_at {
                    if std::time::Instant::now() >= expires_at {
                        return Ok(None);
                    }
                }
                Ok(Some(KvEntry {
                    body: record.body.clone(),
                    metadata: record.metadata.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Option<CacheMetadata>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        check_put(&body, metadata.as_ref(), self.max_value_bytes)?;
        let record = StoredRecord {
            body,
            metadata,
            expires_at: ttl.map(|t| std::time::Instant::now() + t),
        };
        self.records.write().insert(key.to_string(), record);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let records = self.records.read();
        let now = std::time::Instant::now();
        let mut keys: Vec<String> = records
            .iter()
            .filter(|(k, record)| {
                k.starts_with(prefix)
                    && record.expires_at.is_none_or(|expires| now < expires)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.records.write().remove(key);
        Ok(())
    }
}

// ------------------------------------------------------------------
// Redis implementation
// ------------------------------------------------------------------

/// Redis-backed `KvStore`. Value bytes at `<prefix><key>`, metadata JSON at
/// `<prefix><key>#meta`, both written with the same TTL.
pub struct RedisKvStore {
    conn: redis::aio::ConnectionManager,
    prefix: String,
    max_value_bytes: usize,
    op_timeout: Duration,
}

impl RedisKvStore {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StorageError::Timeout),
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError> {
        let full = self.full_key(key);
        let meta_key = format!("{full}{META_SUFFIX}");
        let mut conn = self.conn.clone();

        let (body, meta_json): (Option<Vec<u8>>, Option<String>) = self
            .with_timeout(async move {
                redis::pipe()
                    .get(&full)
                    .get(&meta_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let Some(body) = body else {
            return Ok(None);
        };
        let metadata = match meta_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Some(KvEntry {
            body: Bytes::from(body),
            metadata,
        }))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Option<CacheMetadata>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        check_put(&body, metadata.as_ref(), self.max_value_bytes)?;

        let full = self.full_key(key);
        let meta_key = format!("{full}{META_SUFFIX}");
        let meta_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut conn = self.conn.clone();

        self.with_timeout(async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            match ttl {
                Some(ttl) => {
                    let seconds = ttl.as_secs().max(1);
                    pipe.set_ex(&full, body.as_ref(), seconds);
                    if let Some(json) = &meta_json {
                        pipe.set_ex(&meta_key, json.as_str(), seconds);
                    }
                }
                None => {
                    pipe.set(&full, body.as_ref());
                    if let Some(json) = &meta_json {
                        pipe.set(&meta_key, json.as_str());
                    }
                }
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}{}*", self.prefix, glob_escape(prefix));
        let mut conn = self.conn.clone();
        let store_prefix = self.prefix.clone();

        self.with_timeout(async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(200)
                    .query_async(&mut conn)
                    .await?;
                for key in batch {
                    if key.ends_with(META_SUFFIX) {
                        continue;
                    }
                    if let Some(stripped) = key.strip_prefix(&store_prefix) {
                        keys.push(stripped.to_string());
                    }
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full = self.full_key(key);
        let meta_key = format!("{full}{META_SUFFIX}");
        let mut conn = self.conn.clone();

        self.with_timeout(async move {
            let _: () = redis::pipe()
                .del(&full)
                .del(&meta_key)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }
}

/// Escape redis glob metacharacters so a key prefix matches literally.
fn glob_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
