//! Partitioned command and domain event buses, plus the wait/notification
//! machinery that lets a caller block until a command reaches a stage.
//!
//! - [`MessageBus`] with an in-process implementation, [`InMemoryMessageBus`]
//! - [`RetryingBus`] for bounded retry of transient send failures
//! - [`WaitCoordinator`] and [`CommandGateway`] for send-and-wait

pub mod bus;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod partition;
pub mod stage;
pub mod wait;

pub use bus::{
    BusError, CommandBus, DomainEventBus, MessageBus, MessageStream, RetryingBus, SignalBus,
};
pub use gateway::CommandGateway;
pub use memory::InMemoryMessageBus;
pub use message::{CommandMessage, Message};
pub use partition::PartitionKey;
pub use stage::{CommandStage, UnknownStage};
pub use wait::{
    SIGNAL_TOPIC, SignalEmitter, WaitCoordinator, WaitError, WaitOptions, WaitOutcome, WaitSignal,
};
