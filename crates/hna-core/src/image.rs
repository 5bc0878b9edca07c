use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageClass;

/// Guest firmware required to boot an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    #[default]
    Unknown,
    Bios,
    Uefi,
}

impl std::fmt::Display for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Bios => write!(f, "bios"),
            Self::Uefi => write!(f, "uefi"),
        }
    }
}

/// Catalog entry for one `.qcow2` object in a configured store. An
/// entry whose key is absent from the remote bucket is deleted on the
/// next sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    pub storage: Uuid,
    pub key: String,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub firmware: Firmware,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub storage_class: StorageClass,
}
