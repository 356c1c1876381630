//! Fetch transfer: HTTP source to object store.
//!
//! One GET per attempt; on a 2xx response the whole body becomes the object
//! at the dataset's bucket/key. The store writes atomically, so a failed
//! attempt leaves the previous object in place.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

use stagehouse_core::config::{DatasetConfig, OnExisting};
use stagehouse_core::connection::ConnectionRegistry;
use stagehouse_core::error::StageError;
use stagehouse_core::stage::{RunContext, Runnable, StageKind, StageReport};
use stagehouse_core::storage::{ObjectStore, PutOptions, object_locator, validate_location};
use stagehouse_core::warehouse::Compression;

use crate::http::HttpHook;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct FetchTransfer {
    dataset: DatasetConfig,
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn ObjectStore>,
    http: HttpHook,
}

impl FetchTransfer {
    pub fn new(
        dataset: DatasetConfig,
        registry: Arc<dyn ConnectionRegistry>,
        store: Arc<dyn ObjectStore>,
        http: HttpHook,
    ) -> Self {
        Self {
            dataset,
            registry,
            store,
            http,
        }
    }

    pub fn dataset(&self) -> &DatasetConfig {
        &self.dataset
    }

    fn locator(&self) -> String {
        object_locator(&self.dataset.bucket, &self.dataset.key)
    }

    /// Apply the configured re-encoding. Payloads that are already gzip are
    /// left alone so a gzip dump is never double-compressed.
    fn encode(&self, body: Bytes) -> Result<(Bytes, Option<String>), StageError> {
        match self.dataset.compression {
            Compression::None => Ok((body, self.dataset.content_encoding.clone())),
            Compression::Gzip if body.starts_with(&GZIP_MAGIC) => Ok((body, Some("gzip".into()))),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
                encoder
                    .write_all(&body)
                    .and_then(|_| encoder.finish())
                    .map(|compressed| (Bytes::from(compressed), Some("gzip".into())))
                    .map_err(|e| {
                        StageError::storage_write(
                            &self.dataset.bucket,
                            &self.dataset.key,
                            format!("gzip encoding failed: {e}"),
                        )
                    })
            }
        }
    }
}

impl FetchTransfer {
    /// Outcome when the key is already staged and replace is off.
    fn existing(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        match self.dataset.on_existing {
            OnExisting::Skip => {
                info!(stage = %ctx.stage_id, object = %self.locator(), "Object exists and replace is off, skipping fetch");
                Ok(StageReport::new(format!("skipped, {} already exists", self.locator())))
            }
            OnExisting::Fail => Err(StageError::ObjectExists {
                bucket: self.dataset.bucket.clone(),
                key: self.dataset.key.clone(),
            }),
        }
    }
}

#[async_trait]
impl Runnable for FetchTransfer {
    fn kind(&self) -> StageKind {
        StageKind::Fetch
    }

    fn describe(&self) -> String {
        format!(
            "GET {}:{} -> {}",
            self.dataset.conn_id,
            self.dataset.endpoint,
            self.locator()
        )
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        ctx.check_cancelled()?;
        let ds = &self.dataset;
        validate_location(&ds.bucket, &ds.key)?;

        if !ds.replace && self.store.exists(&ds.bucket, &ds.key).await? {
            return self.existing(ctx);
        }

        let conn = self.registry.resolve(&ds.conn_id)?;
        let body = self.http.get(&conn, &ds.endpoint, &ds.params).await?;
        let fetched = body.len();
        let (payload, content_encoding) = self.encode(body)?;
        debug!(stage = %ctx.stage_id, fetched, staged = payload.len(), "Payload ready");

        let options = PutOptions {
            overwrite: ds.replace,
            access_policy: ds.access_policy,
            content_encoding,
            content_type: ds.content_type.clone(),
        };
        let meta = match self.store.put_object(&ds.bucket, &ds.key, payload, options).await {
            Ok(meta) => meta,
            // Another writer staged the key while this one was downloading.
            Err(StageError::ObjectExists { .. }) => return self.existing(ctx),
            Err(e) => return Err(e),
        };

        info!(
            stage = %ctx.stage_id,
            object = %meta.locator(),
            bytes = meta.size,
            sha256 = %meta.sha256,
            "Object staged"
        );
        Ok(StageReport::new(format!("staged {}", meta.locator())).with_bytes(meta.size))
    }
}
