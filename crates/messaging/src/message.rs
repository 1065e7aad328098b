use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{AggregateId, CommandId};
use event_store::DomainEventStream;
use serde::{Deserialize, Serialize};

use crate::partition::PartitionKey;

/// Anything that can travel over a [`MessageBus`](crate::MessageBus).
pub trait Message: Clone + Send + Sync + 'static {
    /// Topic the message is published on.
    fn topic(&self) -> &str;

    /// Key that decides the lane and therefore the ordering scope.
    fn partition_key(&self) -> PartitionKey;
}

/// A command addressed to one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Stable across redelivery of the same logical command.
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    /// Command name, e.g. "AddItem".
    pub name: String,
    pub body: serde_json::Value,
    pub create_time: DateTime<Utc>,
    /// Propagation headers (wait options, tracing ids).
    #[serde(default)]
    pub header: HashMap<String, String>,
}

impl CommandMessage {
    /// Creates a command with a fresh command ID.
    pub fn new(
        aggregate_id: AggregateId,
        name: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            command_id: CommandId::new(),
            aggregate_id,
            name: name.into(),
            body,
            create_time: Utc::now(),
            header: HashMap::new(),
        }
    }

    /// Creates a command from a serializable body.
    pub fn from_body<T: Serialize>(
        aggregate_id: AggregateId,
        name: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(aggregate_id, name, serde_json::to_value(body)?))
    }

    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Deserializes the body into a concrete command type.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

impl Message for CommandMessage {
    fn topic(&self) -> &str {
        &self.aggregate_id.context_name
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_aggregate(&self.aggregate_id)
    }
}

impl Message for DomainEventStream {
    fn topic(&self) -> &str {
        &self.aggregate_id.context_name
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_aggregate(&self.aggregate_id)
    }
}
