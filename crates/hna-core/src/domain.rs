use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Aaaa => write!(f, "AAAA"),
        }
    }
}

/// One emitted DNS record, owned by the deployment that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: Uuid,
    pub domain: Uuid,
    #[serde(default)]
    pub deployment: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub sub_domain: String,
    pub kind: RecordKind,
    pub value: String,
}

/// Strip a sub-domain label down to lowercase hostname characters.
pub fn filter_domain(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

impl DomainRecord {
    pub fn validate(&mut self) -> Result<Option<ValidationError>> {
        self.sub_domain = filter_domain(&self.sub_domain);

        if self.domain.is_nil() {
            return Ok(Some(ValidationError::new(
                "domain_required",
                "Missing required domain",
            )));
        }

        if self.value.is_empty() {
            return Ok(Some(ValidationError::new(
                "value_required",
                "Missing required value",
            )));
        }

        Ok(None)
    }

    /// Parse a record type name into the closed kind set.
    pub fn parse_kind(value: &str) -> Result<RecordKind> {
        match value {
            "A" => Ok(RecordKind::A),
            "AAAA" => Ok(RecordKind::Aaaa),
            other => Err(Error::Unknown(format!("domain: Unknown record type {}", other)).into()),
        }
    }
}
