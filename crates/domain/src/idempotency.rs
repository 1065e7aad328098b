//! Bounded registry of recently processed command IDs.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use common::CommandId;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Default)]
struct Registry {
    ids: HashSet<CommandId>,
    order: VecDeque<(CommandId, Instant)>,
}

/// Remembers which commands this node already processed.
///
/// Entries leave after `retention` or when `capacity` is exceeded, oldest
/// first. This only short-circuits redeliveries; the event store's
/// per-aggregate duplicate check stays the durable guarantee.
#[derive(Clone)]
pub struct ProcessedCommands {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
    retention: Duration,
}

impl Default for ProcessedCommands {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETENTION)
    }
}

impl ProcessedCommands {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            registry: Arc::default(),
            capacity: capacity.max(1),
            retention,
        }
    }

    pub async fn contains(&self, command_id: CommandId) -> bool {
        let mut registry = self.registry.lock().await;
        self.evict(&mut registry);
        registry.ids.contains(&command_id)
    }

    pub async fn insert(&self, command_id: CommandId) {
        let mut registry = self.registry.lock().await;
        self.evict(&mut registry);
        if !registry.ids.insert(command_id) {
            return;
        }
        registry.order.push_back((command_id, Instant::now()));
        while registry.order.len() > self.capacity {
            if let Some((oldest, _)) = registry.order.pop_front() {
                registry.ids.remove(&oldest);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict(&self, registry: &mut Registry) {
        while let Some((command_id, at)) = registry.order.front().copied() {
            if at.elapsed() < self.retention {
                break;
            }
            registry.order.pop_front();
            registry.ids.remove(&command_id);
        }
    }
}
