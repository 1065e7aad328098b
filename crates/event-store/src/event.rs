use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::CommandId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Unique identifier for an event or an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// Version 0 is an aggregate with no persisted streams. Every persisted
/// stream advances the aggregate by exactly one version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Tail bound meaning "to the end of the log".
    pub const MAX: Version = Version(i64::MAX);

    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a new aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) of the first stream.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous version, never below the initial one.
    pub fn previous(&self) -> Self {
        Self((self.0 - 1).max(0))
    }

    /// Returns true for an aggregate with no applied streams.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// One immutable fact inside a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The event name (e.g., "OrderCreated").
    pub name: String,

    /// 1-based position of the event within its stream.
    pub sequence: u32,

    /// The event body as JSON.
    pub body: serde_json::Value,
}

impl DomainEvent {
    /// Creates an event with a fresh ID.
    pub fn new(name: impl Into<String>, sequence: u32, body: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            name: name.into(),
            sequence,
            body,
        }
    }
}

/// The ordered batch of events produced by one successful command execution
/// against one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventStream {
    /// Unique identifier for this stream.
    pub stream_id: EventId,

    /// The command that produced this stream.
    pub command_id: CommandId,

    /// The aggregate this stream belongs to.
    pub aggregate_id: AggregateId,

    /// The version of the aggregate after applying this stream.
    pub version: Version,

    /// When the stream was produced.
    pub event_time: DateTime<Utc>,

    /// Free-form propagation headers (wait options, tracing ids).
    #[serde(default)]
    pub header: HashMap<String, String>,

    /// The events, in sequence order.
    pub events: Vec<DomainEvent>,
}

impl DomainEventStream {
    /// Creates a new stream builder.
    pub fn builder() -> DomainEventStreamBuilder {
        DomainEventStreamBuilder::default()
    }

    /// The version this stream expects the aggregate to be at before it.
    pub fn expected_version(&self) -> Version {
        self.version.previous()
    }

    /// Number of events in the stream.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the stream carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Builder for constructing event streams.
#[derive(Debug, Default)]
pub struct DomainEventStreamBuilder {
    stream_id: Option<EventId>,
    command_id: Option<CommandId>,
    aggregate_id: Option<AggregateId>,
    version: Option<Version>,
    event_time: Option<DateTime<Utc>>,
    header: HashMap<String, String>,
    events: Vec<DomainEvent>,
}

impl DomainEventStreamBuilder {
    /// Sets the stream ID. If not set, a new ID will be generated.
    pub fn stream_id(mut self, id: EventId) -> Self {
        self.stream_id = Some(id);
        self
    }

    /// Sets the command ID. If not set, a new ID will be generated.
    pub fn command_id(mut self, id: CommandId) -> Self {
        self.command_id = Some(id);
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the version the aggregate reaches after this stream.
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the event time. If not set, the current time will be used.
    pub fn event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Adds a header entry.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Appends an event, assigning the next sequence number.
    pub fn event(mut self, name: impl Into<String>, body: serde_json::Value) -> Self {
        let sequence = self.events.len() as u32 + 1;
        self.events.push(DomainEvent::new(name, sequence, body));
        self
    }

    /// Appends an event from a serializable body.
    pub fn event_from<T: Serialize>(
        self,
        name: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_value(body)?;
        Ok(self.event(name, body))
    }

    /// Builds the stream, returning None if the aggregate ID or version is missing.
    pub fn try_build(self) -> Option<DomainEventStream> {
        Some(DomainEventStream {
            stream_id: self.stream_id.unwrap_or_default(),
            command_id: self.command_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id?,
            version: self.version?,
            event_time: self.event_time.unwrap_or_else(Utc::now),
            header: self.header,
            events: self.events,
        })
    }

    /// Builds the stream.
    ///
    /// # Panics
    ///
    /// Panics if the aggregate ID or version is not set.
    pub fn build(self) -> DomainEventStream {
        self.try_build()
            .expect("aggregate_id and version are required")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(v2.previous(), v1);
        assert!(Version::new(5) < Version::MAX);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::initial().previous(), Version::initial());
        assert_eq!(Version::MAX.next(), Version::MAX);
    }

    #[test]
    fn builder_assigns_sequences() {
        let aggregate_id = AggregateId::new("sales", "order", "o-1");
        let command_id = CommandId::new();

        let stream = DomainEventStream::builder()
            .aggregate_id(aggregate_id.clone())
            .command_id(command_id)
            .version(Version::first())
            .header("wait_stage", "PROJECTED")
            .event("OrderCreated", serde_json::json!({"customer": "c-1"}))
            .event("ItemAdded", serde_json::json!({"sku": "SKU-1"}))
            .build();

        assert_eq!(stream.aggregate_id, aggregate_id);
        assert_eq!(stream.command_id, command_id);
        assert_eq!(stream.expected_version(), Version::initial());
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.events[0].sequence, 1);
        assert_eq!(stream.events[1].sequence, 2);
        assert_eq!(stream.header.get("wait_stage").map(String::as_str), Some("PROJECTED"));
    }

    #[test]
    fn try_build_returns_none_on_missing_fields() {
        assert!(DomainEventStream::builder().try_build().is_none());
    }
}
