use common::{AggregateId, CommandId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key deciding which lane a message travels on.
///
/// Messages with equal keys share a lane and keep their send order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for everything addressed to one aggregate instance.
    pub fn for_aggregate(aggregate_id: &AggregateId) -> Self {
        Self(format!(
            "{}/{}/{}/{}",
            aggregate_id.context_name,
            aggregate_id.aggregate_name,
            aggregate_id.tenant_id,
            aggregate_id.id
        ))
    }

    /// Key for everything concerning one command.
    pub fn for_command(command_id: CommandId) -> Self {
        Self(format!("command/{command_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lane index in `0..partitions`.
    ///
    /// Uses the first eight bytes of the SHA-256 digest, so the same key maps
    /// to the same lane in every process and every build.
    pub fn lane(&self, partitions: usize) -> usize {
        let partitions = partitions.max(1);
        let digest = Sha256::digest(self.0.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % partitions as u64) as usize
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
