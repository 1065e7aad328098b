//! Core projection trait.

use async_trait::async_trait;
use common::NamedAggregate;
use event_store::DomainEventStream;
use messaging::CommandStage;

use crate::Result;

/// What a downstream consumer does with the streams it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorKind {
    /// Maintains a read model.
    #[default]
    Projection,
    /// Reacts to events with side effects.
    EventHandler,
}

impl ProcessorKind {
    /// Stage reported once a stream has been handled.
    pub fn stage(&self) -> CommandStage {
        match self {
            ProcessorKind::Projection => CommandStage::Projected,
            ProcessorKind::EventHandler => CommandStage::EventHandled,
        }
    }
}

/// Consumes domain event streams.
///
/// Streams reach a projection at least once and, per aggregate, in version
/// order; the [`ProjectionProcessor`](crate::ProjectionProcessor) drops
/// redeliveries before they get here.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Returns the name of this projection. Reported in wait signals.
    fn name(&self) -> &str;

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Projection
    }

    /// Returns true if streams of `aggregate` are relevant.
    fn handles(&self, _aggregate: &NamedAggregate) -> bool {
        true
    }

    /// Handles one stream.
    async fn handle(&self, stream: &DomainEventStream) -> Result<()>;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_stage() {
        assert_eq!(ProcessorKind::Projection.stage(), CommandStage::Projected);
        assert_eq!(ProcessorKind::EventHandler.stage(), CommandStage::EventHandled);
        assert_eq!(ProcessorKind::default(), ProcessorKind::Projection);
    }
}
