use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use opendal::layers::BlockingLayer;
use opendal::services::S3;
use opendal::{BlockingOperator, Operator};

use hna_core::errors::Error;
use hna_core::storage::Storage;

use crate::object::{ObjectStore, RemoteObject};

/// S3-compatible store client. Holds its own runtime so the sync
/// pipeline stays a plain blocking thread.
pub struct S3Store {
    op: BlockingOperator,
    _runtime: tokio::runtime::Runtime,
}

impl S3Store {
    pub fn connect(store: &Storage) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Failed to build storage runtime")?;

        let scheme = if store.insecure { "http" } else { "https" };
        let builder = S3::default()
            .endpoint(&format!("{}://{}", scheme, store.endpoint))
            .bucket(&store.bucket)
            .access_key_id(&store.access_key)
            .secret_access_key(&store.secret_key)
            .region("us-east-1");

        // The blocking layer must be created inside a runtime context.
        let _enter = runtime.enter();
        let op: Operator = Operator::new(builder)
            .map_err(|e| Error::Connection(format!("storage: Failed to connect: {}", e)))?
            .layer(
                BlockingLayer::create()
                    .map_err(|e| Error::Connection(format!("storage: Failed to connect: {}", e)))?,
            )
            .finish();

        Ok(Self {
            op: op.blocking(),
            _runtime: runtime,
        })
    }

    fn remote(key: &str, meta: &opendal::Metadata) -> RemoteObject {
        RemoteObject {
            key: key.trim_start_matches('/').to_string(),
            etag: meta.etag().map(str::to_string),
            last_modified: meta
                .last_modified()
                .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH),
            storage_class: None,
        }
    }
}

impl ObjectStore for S3Store {
    fn list_objects(&self) -> Result<Vec<RemoteObject>> {
        let entries = self
            .op
            .list_with("")
            .recursive(true)
            .call()
            .map_err(|e| Error::Request(format!("storage: Failed to list objects: {}", e)))?;

        let mut objects = Vec::new();
        for entry in entries {
            let meta = entry.metadata();
            if !meta.mode().is_file() {
                continue;
            }
            objects.push(Self::remote(entry.path(), meta));
        }
        Ok(objects)
    }

    fn stat_object(&self, key: &str) -> Result<RemoteObject> {
        let meta = self
            .op
            .stat(key)
            .map_err(|e| Error::Read(format!("storage: Failed to stat object: {}", e)))?;
        Ok(Self::remote(key, &meta))
    }
}
