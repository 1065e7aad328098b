use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, mpsc};

use crate::bus::{BusError, MessageBus, MessageStream};
use crate::message::Message;

/// Default number of lanes per consumer group.
pub const DEFAULT_PARTITIONS: usize = 16;

struct Member<M> {
    id: u64,
    tx: mpsc::UnboundedSender<M>,
}

/// Members of one consumer group and the member each lane is pinned to.
struct Group<M> {
    members: Vec<Member<M>>,
    owners: Vec<Option<u64>>,
}

impl<M> Group<M> {
    fn new(partitions: usize) -> Self {
        Self {
            members: Vec::new(),
            owners: vec![None; partitions],
        }
    }

    fn prune(&mut self) {
        self.members.retain(|member| !member.tx.is_closed());
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn owner_of(&self, lane: usize) -> Option<usize> {
        let id = self.owners[lane]?;
        self.members.iter().position(|member| member.id == id)
    }

    /// Pins `lane` to the live member owning the fewest lanes.
    fn assign(&mut self, lane: usize) -> Option<usize> {
        let owners = &self.owners;
        let index = (0..self.members.len()).min_by_key(|&index| {
            let id = self.members[index].id;
            owners.iter().filter(|owner| **owner == Some(id)).count()
        })?;
        self.owners[lane] = Some(self.members[index].id);
        Some(index)
    }

    /// Hands `message` to the owner of `lane`. Returns false when the group
    /// has no live member left.
    fn deliver(&mut self, lane: usize, mut message: M) -> bool {
        loop {
            let index = match self.owner_of(lane) {
                Some(index) => index,
                None => match self.assign(lane) {
                    Some(index) => index,
                    None => return false,
                },
            };
            match self.members[index].tx.send(message) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    self.members.remove(index);
                    self.owners[lane] = None;
                    message = returned;
                }
            }
        }
    }
}

type Groups<M> = HashMap<String, Group<M>>;

/// In-process partitioned bus.
///
/// Each consumer group on a topic owns `partitions` lanes. A lane is pinned
/// to one member the first time it carries a message and stays with that
/// member until the member's stream is dropped; only then does the lane move
/// to the least loaded remaining member. Joining members pick up lanes that
/// are still unassigned or whose owner left, so a key never has messages
/// queued on two members of the same group at once.
///
/// Messages are not retained: a send to a topic with no subscribed group is
/// dropped and still succeeds.
pub struct InMemoryMessageBus<M> {
    partitions: usize,
    topics: Arc<Mutex<HashMap<String, Groups<M>>>>,
    next_member: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl<M> Clone for InMemoryMessageBus<M> {
    fn clone(&self) -> Self {
        Self {
            partitions: self.partitions,
            topics: Arc::clone(&self.topics),
            next_member: Arc::clone(&self.next_member),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<M: Message> Default for InMemoryMessageBus<M> {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl<M: Message> InMemoryMessageBus<M> {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: Arc::default(),
            next_member: Arc::default(),
            closed: Arc::default(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of live members in `group` on `topic`.
    pub async fn member_count(&self, topic: &str, group: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .and_then(|groups| groups.get(group))
            .map(|group| {
                group
                    .members
                    .iter()
                    .filter(|member| !member.tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Shuts the bus down. Every subscriber stream ends and later sends fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.lock().await.clear();
    }
}

#[async_trait]
impl<M: Message> MessageBus<M> for InMemoryMessageBus<M> {
    async fn send(&self, message: M) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let lane = message.partition_key().lane(self.partitions);
        let mut topics = self.topics.lock().await;
        let Some(groups) = topics.get_mut(message.topic()) else {
            tracing::debug!(topic = message.topic(), "no subscribers, message dropped");
            return Ok(());
        };

        for (name, group) in groups.iter_mut() {
            group.prune();
            if !group.deliver(lane, message.clone()) {
                tracing::debug!(
                    topic = message.topic(),
                    group = %name,
                    "group has no live members"
                );
            }
        }
        groups.retain(|_, group| !group.is_empty());

        metrics::counter!("bus_messages_sent_total").increment(1);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<MessageStream<M>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_member.fetch_add(1, Ordering::SeqCst);
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(|| Group::new(self.partitions))
            .members
            .push(Member { id, tx });

        tracing::debug!(topic, group, member = id, "subscribed");

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionKey;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Keyed {
        key: String,
        seq: u32,
    }

    impl Message for Keyed {
        fn topic(&self) -> &str {
            "sales"
        }

        fn partition_key(&self) -> PartitionKey {
            PartitionKey::new(self.key.clone())
        }
    }

    fn keyed(key: &str, seq: u32) -> Keyed {
        Keyed {
            key: key.to_string(),
            seq,
        }
    }

    async fn next(stream: &mut MessageStream<Keyed>) -> Option<Keyed> {
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn every_group_receives_every_message() {
        let bus = InMemoryMessageBus::new(4);
        let mut a = bus.subscribe("sales", "projector").await.unwrap();
        let mut b = bus.subscribe("sales", "notifier").await.unwrap();

        bus.send(keyed("o-1", 1)).await.unwrap();

        assert_eq!(next(&mut a).await, Some(keyed("o-1", 1)));
        assert_eq!(next(&mut b).await, Some(keyed("o-1", 1)));
    }

    #[tokio::test]
    async fn same_key_is_delivered_in_order_to_one_member() {
        let bus = InMemoryMessageBus::new(8);
        let mut first = bus.subscribe("sales", "workers").await.unwrap();
        let mut second = bus.subscribe("sales", "workers").await.unwrap();

        for seq in 1..=20 {
            bus.send(keyed("o-1", seq)).await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(message) = next(&mut first).await {
            received.push(message);
        }
        while let Some(message) = next(&mut second).await {
            received.push(message);
        }

        let seqs: Vec<u32> = received.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropped_member_lanes_are_reassigned() {
        let bus = InMemoryMessageBus::new(2);
        let first = bus.subscribe("sales", "workers").await.unwrap();
        let mut second = bus.subscribe("sales", "workers").await.unwrap();
        drop(first);

        for seq in 1..=5 {
            bus.send(keyed(&format!("o-{seq}"), seq)).await.unwrap();
        }

        let mut count = 0;
        while next(&mut second).await.is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(bus.member_count("sales", "workers").await, 1);
    }

    #[tokio::test]
    async fn joining_member_does_not_take_a_busy_lane() {
        let bus = InMemoryMessageBus::new(4);
        let mut first = bus.subscribe("sales", "workers").await.unwrap();

        bus.send(keyed("o-1", 1)).await.unwrap();
        let mut second = bus.subscribe("sales", "workers").await.unwrap();
        bus.send(keyed("o-1", 2)).await.unwrap();

        assert_eq!(next(&mut first).await, Some(keyed("o-1", 1)));
        assert_eq!(next(&mut first).await, Some(keyed("o-1", 2)));
        assert_eq!(next(&mut second).await, None);
    }

    #[tokio::test]
    async fn lane_moves_once_its_owner_leaves() {
        let bus = InMemoryMessageBus::new(4);
        let mut first = bus.subscribe("sales", "workers").await.unwrap();
        let mut second = bus.subscribe("sales", "workers").await.unwrap();

        bus.send(keyed("o-1", 1)).await.unwrap();
        let (owner, mut survivor) = match next(&mut first).await {
            Some(_) => (first, second),
            None => {
                assert_eq!(next(&mut second).await, Some(keyed("o-1", 1)));
                (second, first)
            }
        };
        drop(owner);

        bus.send(keyed("o-1", 2)).await.unwrap();
        assert_eq!(next(&mut survivor).await, Some(keyed("o-1", 2)));
    }

    #[tokio::test]
    async fn unused_lanes_spread_across_members() {
        let bus = InMemoryMessageBus::new(2);
        let mut first = bus.subscribe("sales", "workers").await.unwrap();
        let mut second = bus.subscribe("sales", "workers").await.unwrap();

        let keys: Vec<String> = (0..64)
            .map(|n| format!("o-{n}"))
            .filter(|key| PartitionKey::new(key.clone()).lane(2) == 0)
            .take(1)
            .chain(
                (0..64)
                    .map(|n| format!("o-{n}"))
                    .filter(|key| PartitionKey::new(key.clone()).lane(2) == 1)
                    .take(1),
            )
            .collect();
        assert_eq!(keys.len(), 2);

        for key in &keys {
            bus.send(keyed(key, 1)).await.unwrap();
        }

        assert!(next(&mut first).await.is_some());
        assert!(next(&mut second).await.is_some());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_dropped() {
        let bus = InMemoryMessageBus::new(2);
        assert_eq!(bus.send(keyed("o-1", 1)).await, Ok(()));

        let mut late = bus.subscribe("sales", "workers").await.unwrap();
        assert_eq!(next(&mut late).await, None);
    }

    #[tokio::test]
    async fn other_topics_are_not_delivered() {
        let bus: InMemoryMessageBus<Keyed> = InMemoryMessageBus::new(2);
        let mut billing = bus.subscribe("billing", "workers").await.unwrap();

        bus.send(keyed("o-1", 1)).await.unwrap();
        assert_eq!(next(&mut billing).await, None);
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_sends() {
        let bus = InMemoryMessageBus::new(2);
        let mut stream = bus.subscribe("sales", "workers").await.unwrap();

        bus.close().await;

        assert_eq!(stream.next().await, None);
        assert_eq!(bus.send(keyed("o-1", 1)).await, Err(BusError::Closed));
        assert!(bus.subscribe("sales", "workers").await.is_err());
    }
}
