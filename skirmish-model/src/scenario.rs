use serde::{Deserialize, Serialize};

use crate::ids::ScenarioId;
use crate::objective::ObjectiveSpecList;

pub use crate::objective::ObjectiveSpec;

/// Role a VM plays inside the exercise topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRole {
    Attacker,
    Workstation,
    Server,
    DomainController,
    Sensor,
}

/// One isolated network segment and the VM roles attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSegment {
    pub name: String,
    pub cidr: String,
    pub roles: Vec<VmRole>,
}

/// Topology requirements handed to the provisioning driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub segments: Vec<NetworkSegment>,
}

impl TopologySpec {
    pub fn vm_count(&self) -> usize {
        self.segments.iter().map(|s| s.roles.len()).sum()
    }
}

/// Reference to a configuration playbook resolved by the configuration driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookRef(pub String);

impl PlaybookRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reference to an adversary-emulation plan resolved by the attack driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackPlanRef(pub String);

impl AttackPlanRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Immutable scenario template.
///
/// Authored once, versioned, and never mutated after a run starts; runs
/// hold a shared read-only reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub id: ScenarioId,
    pub name: String,
    pub version: u32,
    pub objectives: ObjectiveSpecList,
    pub topology: TopologySpec,
    pub playbook: PlaybookRef,
    pub attack_plan: AttackPlanRef,
}
