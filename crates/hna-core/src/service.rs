use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Instance,
    Image,
}

/// One deployable unit within a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: Uuid,
    pub name: String,
    pub kind: UnitKind,
    #[serde(default)]
    pub certificates: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    #[serde(default)]
    pub units: Vec<Unit>,
}

impl Service {
    pub fn unit(&self, id: Uuid) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }
}

/// Resolved deployment contract for a unit at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: Uuid,
    pub unit: Uuid,
    #[serde(default)]
    pub instance: Option<SpecInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecInstance {
    #[serde(default)]
    pub plan: Option<Uuid>,
    #[serde(default)]
    pub domain: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub name: String,
}
