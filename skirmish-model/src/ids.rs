use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Strongly typed ID for scenario definitions.
    ScenarioId
);
uuid_id!(
    /// Strongly typed ID for a single scenario run.
    RunId
);
uuid_id!(
    /// Strongly typed ID for an ingested raw event.
    RawEventId
);
uuid_id!(
    /// Strongly typed ID for a correlated (derived) event.
    CorrelatedEventId
);
uuid_id!(
    /// Strongly typed ID for the participant team that owns a run.
    TeamId
);

/// Identifier for an adversary-emulation operation, minted by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque handle to a provisioned infrastructure resource.
///
/// Minted by the provisioning driver and treated as a black box by the
/// core; the only thing the pipeline does with one is hand it back to
/// `destroy` during teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle(pub String);

impl ResourceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ResourceHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
