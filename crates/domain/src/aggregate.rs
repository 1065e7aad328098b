//! Core state and event traits.

use common::{AggregateId, NamedAggregate};
use serde::{Serialize, de::DeserializeOwned};

/// Trait for the typed events an aggregate state consumes.
///
/// Events represent facts that have happened in the domain. They are
/// immutable and should be named in past tense.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event name stored alongside the body.
    fn event_name(&self) -> &'static str;
}

/// Static identity of an aggregate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateAggregateMetadata {
    pub context_name: &'static str,
    pub aggregate_name: &'static str,
}

impl StateAggregateMetadata {
    pub const fn new(context_name: &'static str, aggregate_name: &'static str) -> Self {
        Self {
            context_name,
            aggregate_name,
        }
    }

    pub fn named_aggregate(&self) -> NamedAggregate {
        NamedAggregate::new(self.context_name, self.aggregate_name)
    }

    /// Returns true if `aggregate_id` names an instance of this type.
    pub fn matches(&self, aggregate_id: &AggregateId) -> bool {
        aggregate_id.context_name == self.context_name
            && aggregate_id.aggregate_name == self.aggregate_name
    }

    /// Creates an ID of this type in the default tenant.
    pub fn aggregate_id(&self, id: impl Into<String>) -> AggregateId {
        AggregateId::new(self.context_name, self.aggregate_name, id)
    }
}

/// The user-defined state folded from an aggregate's history.
///
/// `apply` must be pure and deterministic: the same state and event always
/// give the same new state, and it never fails because events are facts.
/// The state must round-trip through serde so it can be snapshotted.
pub trait AggregateState:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The type of events this state consumes.
    type Event: EventPayload;

    /// The error a command decision can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identity of the aggregate type.
    fn metadata() -> StateAggregateMetadata;

    /// Applies an event to the state.
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
