use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Processing milestones of a command, in the order they are reached.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStage {
    /// The command was handed to the command bus.
    Sent,
    /// The aggregate handled the command and its stream was persisted.
    #[default]
    Processed,
    /// A snapshot covering the command's stream was written.
    Snapshot,
    /// A projection applied the command's stream.
    Projected,
    /// An event handler reacted to the command's stream.
    EventHandled,
}

impl CommandStage {
    pub const ALL: [CommandStage; 5] = [
        CommandStage::Sent,
        CommandStage::Processed,
        CommandStage::Snapshot,
        CommandStage::Projected,
        CommandStage::EventHandled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStage::Sent => "SENT",
            CommandStage::Processed => "PROCESSED",
            CommandStage::Snapshot => "SNAPSHOT",
            CommandStage::Projected => "PROJECTED",
            CommandStage::EventHandled => "EVENT_HANDLED",
        }
    }

    /// Stages reported by a named downstream processor.
    pub fn is_processor_stage(&self) -> bool {
        matches!(self, CommandStage::Projected | CommandStage::EventHandled)
    }
}

impl std::fmt::Display for CommandStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown command stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for CommandStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        CommandStage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
