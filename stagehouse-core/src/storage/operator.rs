//! [`ObjectStore`] over an OpenDAL [`Operator`].
//!
//! Objects live at `<bucket>/<key>` under the operator root and their
//! metadata at `.meta/<bucket>/<key>.json`. Bucket names may not start with
//! a dot, so the two never collide.
//!
//! A put writes the metadata first and the object second; if the object
//! write fails the previous metadata is restored. The filesystem operator
//! writes objects through a temp dir and renames them into place, so a
//! reader sees either the previous object or the complete new one.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use std::path::Path;
use tracing::{debug, warn};

use super::{ObjectMeta, ObjectStore, PutOptions, local, memory, validate_location};
use crate::error::StageError;

const META_DIR: &str = ".meta";

#[derive(Debug, Clone)]
pub struct OperatorStore {
    name: &'static str,
    op: Operator,
}

impl OperatorStore {
    /// Store rooted at a local directory; created if missing.
    pub fn local(root: &Path) -> Result<Self, StageError> {
        let op = local::build_fs_operator(root)
            .map_err(|e| StageError::storage_write(root.display().to_string(), "", e.to_string()))?;
        Ok(Self { name: "fs", op })
    }

    /// Store held in process memory.
    pub fn memory() -> Result<Self, StageError> {
        let op = memory::build_memory_operator()
            .map_err(|e| StageError::storage_write("memory", "", e.to_string()))?;
        Ok(Self { name: "memory", op })
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

fn meta_path(bucket: &str, key: &str) -> String {
    format!("{META_DIR}/{bucket}/{key}.json")
}

fn storage_error(bucket: &str, key: &str, err: opendal::Error) -> StageError {
    StageError::storage_write(bucket, key, err.to_string())
}

impl OperatorStore {
    /// Raw bytes at `path`, or `None` if absent.
    async fn read_optional(&self, path: &str) -> Result<Option<Bytes>, opendal::Error> {
        match self.op.read(path).await {
            Ok(buffer) => Ok(Some(buffer.to_bytes())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Put the metadata sidecar back the way it was before a failed put.
    async fn restore_meta(&self, bucket: &str, key: &str, previous: Option<Bytes>) {
        let path = meta_path(bucket, key);
        let restored = match previous {
            Some(raw) => self.op.write(&path, raw).await.map(|_| ()),
            None => self.op.delete(&path).await,
        };
        if let Err(e) = restored {
            warn!(bucket, key, error = %e, "Failed to restore object metadata");
        }
    }
}

#[async_trait]
impl ObjectStore for OperatorStore {
    fn name(&self) -> &str {
        self.name
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Bytes,
        options: PutOptions,
    ) -> Result<ObjectMeta, StageError> {
        validate_location(bucket, key)?;
        let path = object_path(bucket, key);
        if !options.overwrite
            && self
                .op
                .exists(&path)
                .await
                .map_err(|e| storage_error(bucket, key, e))?
        {
            return Err(StageError::ObjectExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let meta = ObjectMeta::describe(bucket, key, &payload, &options);
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StageError::storage_write(bucket, key, e.to_string()))?;
        let previous_meta = self
            .read_optional(&meta_path(bucket, key))
            .await
            .map_err(|e| storage_error(bucket, key, e))?;

        self.op
            .write(&meta_path(bucket, key), meta_json)
            .await
            .map_err(|e| StageError::storage_write(bucket, key, format!("metadata: {e}")))?;
        if let Err(e) = self.op.write(&path, payload).await {
            self.restore_meta(bucket, key, previous_meta).await;
            return Err(storage_error(bucket, key, e));
        }

        debug!(store = self.name, bucket, key, size = meta.size, "Object written");
        Ok(meta)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StageError> {
        validate_location(bucket, key)?;
        match self.read_optional(&object_path(bucket, key)).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(StageError::storage_write(bucket, key, "object not found")),
            Err(e) => Err(StageError::storage_write(bucket, key, format!("read failed: {e}"))),
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StageError> {
        validate_location(bucket, key)?;
        let path = object_path(bucket, key);
        let stat = match self.op.stat(&path).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(bucket, key, e)),
        };
        let recorded = self
            .read_optional(&meta_path(bucket, key))
            .await
            .map_err(|e| storage_error(bucket, key, e))?
            .map(|raw| serde_json::from_slice::<ObjectMeta>(&raw))
            .transpose()
            .map_err(|e| StageError::storage_write(bucket, key, format!("corrupt metadata: {e}")))?;
        match recorded {
            Some(meta) if meta.size == stat.content_length() => Ok(Some(meta)),
            // Placed by hand, or the sidecar does not describe this payload.
            _ => {
                let payload = self.get_object(bucket, key).await?;
                Ok(Some(ObjectMeta::describe(
                    bucket,
                    key,
                    &payload,
                    &PutOptions::default(),
                )))
            }
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StageError> {
        validate_location(bucket, key)?;
        let path = object_path(bucket, key);
        if !self
            .op
            .exists(&path)
            .await
            .map_err(|e| storage_error(bucket, key, e))?
        {
            return Ok(false);
        }
        self.op
            .delete(&path)
            .await
            .map_err(|e| storage_error(bucket, key, e))?;
        if let Err(e) = self.op.delete(&meta_path(bucket, key)).await {
            warn!(bucket, key, error = %e, "Failed to delete object metadata");
        }
        Ok(true)
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StageError> {
        let dir = format!("{bucket}/");
        let entries = match self.op.list_with(&dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(bucket, prefix, e)),
        };
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|entry| entry.metadata().mode().is_file())
            .filter_map(|entry| entry.path().strip_prefix(&dir))
            .filter(|key| key.starts_with(prefix))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }
}
