use std::sync::Arc;

use crate::bus::{BusError, CommandBus};
use crate::message::CommandMessage;
use crate::stage::CommandStage;
use crate::wait::{WaitCoordinator, WaitError, WaitOptions, WaitOutcome, WaitSignal};

/// Entry point for callers submitting commands.
#[derive(Clone)]
pub struct CommandGateway {
    command_bus: Arc<CommandBus>,
    coordinator: WaitCoordinator,
}

impl CommandGateway {
    pub fn new(command_bus: Arc<CommandBus>, coordinator: WaitCoordinator) -> Self {
        Self {
            command_bus,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &WaitCoordinator {
        &self.coordinator
    }

    /// Sends a command without waiting for any processing.
    #[tracing::instrument(
        skip(self, command),
        fields(command_id = %command.command_id, aggregate_id = %command.aggregate_id)
    )]
    pub async fn send(&self, command: CommandMessage) -> Result<(), BusError> {
        let signal = WaitSignal::new(
            command.command_id,
            command.aggregate_id.clone(),
            CommandStage::Sent,
        );
        self.command_bus.send(command).await?;
        metrics::counter!("commands_sent_total").increment(1);
        self.coordinator.notify(signal).await;
        Ok(())
    }

    /// Sends a command and waits until it reaches `options.stage`.
    ///
    /// The wait options travel in the command header so downstream
    /// processors know what the caller is waiting for.
    pub async fn send_and_wait(
        &self,
        mut command: CommandMessage,
        options: WaitOptions,
    ) -> Result<WaitOutcome, WaitError> {
        let command_id = command.command_id;
        options.write_header(&mut command.header);
        self.send(command).await?;
        self.coordinator.wait(command_id, options).await
    }
}
