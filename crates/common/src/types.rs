use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant used when a command does not name one.
pub const DEFAULT_TENANT_ID: &str = "(0)";

/// An aggregate type within a bounded context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamedAggregate {
    pub context_name: String,
    pub aggregate_name: String,
}

impl NamedAggregate {
    pub fn new(context_name: impl Into<String>, aggregate_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            aggregate_name: aggregate_name.into(),
        }
    }

    /// Creates an aggregate ID of this type for the default tenant.
    pub fn aggregate_id(&self, id: impl Into<String>) -> AggregateId {
        AggregateId::new(
            self.context_name.clone(),
            self.aggregate_name.clone(),
            id.into(),
        )
    }
}

impl std::fmt::Display for NamedAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.context_name, self.aggregate_name)
    }
}

/// Globally identifies one aggregate instance.
///
/// The identity is scoped by bounded context, aggregate type and tenant, so
/// two aggregates with the same raw `id` in different tenants never share a
/// partition in the event log or on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId {
    pub context_name: String,
    pub aggregate_name: String,
    pub tenant_id: String,
    pub id: String,
}

impl AggregateId {
    /// Creates an aggregate ID in the default tenant.
    pub fn new(
        context_name: impl Into<String>,
        aggregate_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            context_name: context_name.into(),
            aggregate_name: aggregate_name.into(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            id: id.into(),
        }
    }

    /// Creates an aggregate ID with a random `id` in the default tenant.
    pub fn generate(context_name: impl Into<String>, aggregate_name: impl Into<String>) -> Self {
        Self::new(context_name, aggregate_name, Uuid::new_v4().to_string())
    }

    /// Returns a copy scoped to the given tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Returns the aggregate type this instance belongs to.
    pub fn named_aggregate(&self) -> NamedAggregate {
        NamedAggregate::new(self.context_name.clone(), self.aggregate_name.clone())
    }

    /// Returns true if this instance is of the given aggregate type.
    pub fn is_same_aggregate(&self, named: &NamedAggregate) -> bool {
        self.context_name == named.context_name && self.aggregate_name == named.aggregate_name
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}({}@{})",
            self.context_name, self.aggregate_name, self.id, self.tenant_id
        )
    }
}

/// Identifies one logical command, stable across redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Creates a new random command ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a command ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CommandId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
