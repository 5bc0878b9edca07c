use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::error;
use uuid::Uuid;

use hna_core::db::Database;
use hna_core::errors::Error;
use hna_core::image::{Firmware, Image};
use hna_core::lock::MultiTimeoutLock;
use hna_core::storage::{parse_storage_class, Storage, StorageClass};

use crate::object::{etag, ObjectStore};

static SYNC_LOCK: MultiTimeoutLock = MultiTimeoutLock::new(Duration::from_secs(60));

fn image_name(key: &str) -> String {
    Path::new(key)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Reconcile the image catalog for one store against the remote
/// bucket. Concurrent syncs of the same store are rejected by the
/// keyed lock; different stores run in parallel.
pub fn sync(db: &dyn Database, store: &Storage, client: &dyn ObjectStore) -> Result<()> {
    if store.endpoint.is_empty() {
        return Ok(());
    }

    let _guard = SYNC_LOCK.try_lock(&store.id.to_string())?;

    let objects = client.list_objects()?;

    let mut images: Vec<Image> = Vec::new();
    let mut signed_keys: HashSet<String> = HashSet::new();
    let mut remote_keys: HashSet<String> = HashSet::new();

    for object in objects {
        if object.key.ends_with(".qcow2.sig") {
            signed_keys.insert(object.key.trim_end_matches(".sig").to_string());
        } else if object.key.ends_with(".qcow2") {
            remote_keys.insert(object.key.clone());

            let storage_class = if store.is_oracle() {
                let stat = client.stat_object(&object.key)?;
                stat.storage_class
                    .as_deref()
                    .map(parse_storage_class)
                    .unwrap_or(StorageClass::Unknown)
            } else {
                object
                    .storage_class
                    .as_deref()
                    .map(parse_storage_class)
                    .unwrap_or(StorageClass::Unknown)
            };

            images.push(Image {
                id: Uuid::new_v4(),
                name: image_name(&object.key),
                organization: None,
                storage: store.id,
                key: object.key.clone(),
                signed: false,
                firmware: Firmware::Unknown,
                etag: etag(&object),
                last_modified: object.last_modified,
                storage_class,
            });
        }
    }

    for img in images.iter_mut() {
        img.signed = signed_keys.contains(&img.key);

        if img.signed {
            if img.key.contains("_efi") || img.key.contains("_uefi") {
                img.firmware = Firmware::Uefi;
            } else {
                img.firmware = Firmware::Bios;
            }
        }

        if let Err(err) = db.upsert_image(img) {
            if Error::is_lost_image(&err) {
                error!(
                    bucket = %store.bucket,
                    key = %img.key,
                    "storage: Ignoring lost image",
                );
            } else {
                return Err(err);
            }
        }
    }

    let local_keys = db.image_keys(store.id)?;
    let remove_keys: Vec<String> = local_keys
        .into_iter()
        .filter(|key| !remote_keys.contains(key))
        .collect();

    db.remove_image_keys(store.id, &remove_keys)?;

    Ok(())
}
