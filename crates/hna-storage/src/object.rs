use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use regex::Regex;

use hna_core::time::rfc3339;

/// One object as observed in a remote bucket.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    /// Server-provided entity tag, when the listing carried one.
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Provider storage-class string, when available.
    pub storage_class: Option<String>,
}

/// The object-store contract the sync depends on: a recursive listing
/// and a per-object stat. The client implementation is an external
/// integration.
pub trait ObjectStore: Send + Sync {
    fn list_objects(&self) -> Result<Vec<RemoteObject>>;
    fn stat_object(&self, key: &str) -> Result<RemoteObject>;
}

fn etag_filter() -> &'static Regex {
    static FILTER: OnceLock<Regex> = OnceLock::new();
    FILTER.get_or_init(|| Regex::new("[^a-zA-Z0-9]+").unwrap())
}

/// Entity tag for a remote object: the server's ETag when present,
/// else the MD5 of the last-modified time in RFC 3339 form. Filtered
/// to alphanumerics.
pub fn etag(object: &RemoteObject) -> String {
    let raw = match &object.etag {
        Some(etag) if !etag.is_empty() => etag.clone(),
        _ => {
            let mut hasher = Md5::new();
            hasher.update(rfc3339(object.last_modified).as_bytes());
            format!("{:x}", hasher.finalize())
        }
    };

    etag_filter().replace_all(&raw, "").to_string()
}
