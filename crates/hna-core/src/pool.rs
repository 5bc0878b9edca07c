use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A storage pool scoped to a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
    pub zone: Uuid,
}

/// Instance sizing template matched to nodes by network role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub processors: u32,
    #[serde(default)]
    pub memory: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduler {
    pub id: Uuid,
    pub name: String,
}
