use std::pin::Pin;

use async_trait::async_trait;
use common::{IsTransient, RetryPolicy, retry_transient};
use event_store::DomainEventStream;
use futures_core::Stream;
use thiserror::Error;

use crate::message::{CommandMessage, Message};
use crate::wait::WaitSignal;

/// Errors raised by message buses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus could not accept the message. Retrying may succeed.
    #[error("Message bus unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    /// The bus has shut down.
    #[error("Message bus closed")]
    Closed,
}

impl IsTransient for BusError {
    fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable { .. })
    }
}

/// Unbounded sequence of messages delivered to one subscriber.
pub type MessageStream<M> = Pin<Box<dyn Stream<Item = M> + Send>>;

/// Partitioned publish/subscribe transport.
///
/// Every consumer group subscribed to a topic receives every message sent to
/// that topic. Within a group each message is delivered to exactly one
/// member. Messages with equal partition keys reach a group in send order.
/// Delivery is at-least-once to the groups subscribed when the message is
/// sent. Implementations may drop messages for topics nobody subscribes to.
#[async_trait]
pub trait MessageBus<M: Message>: Send + Sync {
    /// Publishes a message on its topic.
    async fn send(&self, message: M) -> Result<(), BusError>;

    /// Joins `group` on `topic` and returns the member's delivery stream.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<MessageStream<M>, BusError>;
}

pub type CommandBus = dyn MessageBus<CommandMessage>;
pub type DomainEventBus = dyn MessageBus<DomainEventStream>;
pub type SignalBus = dyn MessageBus<WaitSignal>;

/// Decorator retrying transient send failures with exponential backoff.
///
/// Once the budget is spent the send fails with `BusError::Unavailable`
/// carrying the number of attempts made.
#[derive(Debug, Clone)]
pub struct RetryingBus<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B> RetryingBus<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<M, B> MessageBus<M> for RetryingBus<B>
where
    M: Message,
    B: MessageBus<M>,
{
    async fn send(&self, message: M) -> Result<(), BusError> {
        let topic = message.topic().to_string();
        let result = retry_transient(&self.policy, "bus.send", |_| {
            self.inner.send(message.clone())
        })
        .await;

        match result {
            Err(BusError::Unavailable { reason, .. }) => {
                metrics::counter!("bus_send_failures_total").increment(1);
                tracing::error!(topic = %topic, reason = %reason, "send retry budget exhausted");
                Err(BusError::Unavailable {
                    attempts: self.policy.max_attempts.max(1),
                    reason,
                })
            }
            other => other,
        }
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<MessageStream<M>, BusError> {
        self.inner.subscribe(topic, group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionKey;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Message for Ping {
        fn topic(&self) -> &str {
            "ping"
        }

        fn partition_key(&self) -> PartitionKey {
            PartitionKey::new("ping")
        }
    }

    /// Fails the first `failures` sends, then accepts.
    struct FlakyBus {
        failures: u32,
        calls: Arc<AtomicU32>,
        error: BusError,
    }

    #[async_trait]
    impl MessageBus<Ping> for FlakyBus {
        async fn send(&self, _message: Ping) -> Result<(), BusError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
        ) -> Result<MessageStream<Ping>, BusError> {
            Err(BusError::Closed)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn flaky(failures: u32, error: BusError) -> (FlakyBus, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let bus = FlakyBus {
            failures,
            calls: Arc::clone(&calls),
            error,
        };
        (bus, calls)
    }

    fn unavailable() -> BusError {
        BusError::Unavailable {
            attempts: 1,
            reason: "broker down".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (inner, calls) = flaky(2, unavailable());
        let bus = RetryingBus::new(inner, fast_policy(3));

        bus.send(Ping).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_attempts() {
        let (inner, calls) = flaky(10, unavailable());
        let bus = RetryingBus::new(inner, fast_policy(4));

        let result = bus.send(Ping).await;
        assert_eq!(
            result,
            Err(BusError::Unavailable {
                attempts: 4,
                reason: "broker down".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn closed_is_not_retried() {
        let (inner, calls) = flaky(10, BusError::Closed);
        let bus = RetryingBus::new(inner, fast_policy(5));

        assert_eq!(bus.send(Ping).await, Err(BusError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
