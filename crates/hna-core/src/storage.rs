use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Object-store flavor. Oracle stores do not report storage class in
/// listings, so the sync stats each object individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    S3,
    Oracle,
}

/// Remote object storage class as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    #[default]
    Unknown,
    Standard,
    InfrequentAccess,
    Archive,
}

/// Map a provider storage-class string to the closed set.
pub fn parse_storage_class(value: &str) -> StorageClass {
    match value.to_uppercase().as_str() {
        "STANDARD" => StorageClass::Standard,
        "STANDARD_IA" | "INFREQUENTACCESS" | "INFREQUENT_ACCESS" => {
            StorageClass::InfrequentAccess
        }
        "GLACIER" | "ARCHIVE" | "DEEP_ARCHIVE" => StorageClass::Archive,
        _ => StorageClass::Unknown,
    }
}

/// A configured object store holding the image catalog for one or
/// more nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub kind: StorageKind,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub insecure: bool,
}

impl Storage {
    pub fn is_oracle(&self) -> bool {
        self.kind == StorageKind::Oracle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_class() {
        assert_eq!(parse_storage_class("STANDARD"), StorageClass::Standard);
        assert_eq!(parse_storage_class("standard"), StorageClass::Standard);
        assert_eq!(
            parse_storage_class("STANDARD_IA"),
            StorageClass::InfrequentAccess
        );
        assert_eq!(parse_storage_class("Archive"), StorageClass::Archive);
        assert_eq!(parse_storage_class(""), StorageClass::Unknown);
        assert_eq!(parse_storage_class("REDUCED"), StorageClass::Unknown);
    }

    #[test]
    fn test_is_oracle() {
        let store = Storage {
            id: Uuid::new_v4(),
            name: "images".to_string(),
            kind: StorageKind::Oracle,
            endpoint: "objectstorage.us-ashburn-1.oraclecloud.com".to_string(),
            bucket: "images".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            insecure: false,
        };
        assert!(store.is_oracle());
    }
}
