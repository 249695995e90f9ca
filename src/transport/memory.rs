//! In-memory broker.
//!
//! Queues are unbounded mpsc channels whose receiving half is shared by every
//! consumer attached to the queue, which gives competing-consumer delivery for
//! free. Topic bindings fan out one copy per bound queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Duration};

use super::{topic_matches, Delivery, DeliveryTag, ListenChannel, ListenerSpec, Transport};
use crate::envelope::Message;
use crate::types::{Error, Result};

// =============================================================================
// Broker State
// =============================================================================

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Message>>>;

#[derive(Debug)]
struct QueueState {
    tx: mpsc::UnboundedSender<Message>,
    rx: SharedReceiver,
    consumers: usize,
    exclusive: bool,
}

impl QueueState {
    fn new(exclusive: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            consumers: 0,
            exclusive,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// (topic pattern, queue name)
    bindings: Vec<(String, String)>,
}

/// Statistics about broker usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub messages_sent: u64,
    pub messages_published: u64,
    pub messages_undeliverable: u64,
    pub messages_requeued: u64,
    pub queues: usize,
    pub bindings: usize,
}

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub consumers: usize,
    pub bindings: Vec<String>,
}

// =============================================================================
// InMemoryBroker
// =============================================================================

/// In-process broker implementing [`Transport`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    stats: Arc<RwLock<BrokerStats>>,
    anon_counter: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumers and bindings of a queue, if it exists.
    pub async fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        let state = self.state.read().await;
        let queue = state.queues.get(name)?;
        Some(QueueInfo {
            name: name.to_string(),
            consumers: queue.consumers,
            bindings: state
                .bindings
                .iter()
                .filter(|(_, q)| q == name)
                .map(|(pattern, _)| pattern.clone())
                .collect(),
        })
    }

    /// Get current broker statistics.
    pub async fn get_stats(&self) -> BrokerStats {
        let state = self.state.read().await;
        let mut stats = self.stats.read().await.clone();
        stats.queues = state.queues.len();
        stats.bindings = state.bindings.len();
        stats
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn send(&self, queue: &str, message: Message) -> Result<()> {
        let delivered = {
            let state = self.state.read().await;
            state
                .queues
                .get(queue)
                .map(|q| q.tx.send(message).is_ok())
                .unwrap_or(false)
        };

        let mut stats = self.stats.write().await;
        if delivered {
            stats.messages_sent += 1;
            tracing::debug!("Sent message to queue={}", queue);
        } else {
            stats.messages_undeliverable += 1;
            tracing::debug!("Dropped unroutable message for queue={}", queue);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<usize> {
        let delivered = {
            let state = self.state.read().await;
            let targets: HashSet<&str> = state
                .bindings
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .map(|(_, queue)| queue.as_str())
                .collect();

            targets
                .into_iter()
                .filter_map(|name| state.queues.get(name))
                .filter(|q| q.tx.send(message.clone()).is_ok())
                .count()
        };

        let mut stats = self.stats.write().await;
        stats.messages_published += 1;

        tracing::debug!("Published topic={} to {} queues", topic, delivered);

        Ok(delivered)
    }

    async fn declare_listener(&self, spec: ListenerSpec) -> Result<Box<dyn ListenChannel>> {
        let (name, exclusive) = match spec.queue {
            Some(name) => (name, false),
            None => {
                let n = self.anon_counter.fetch_add(1, Ordering::Relaxed) + 1;
                (format!("amq.gen-{}", n), true)
            }
        };

        let mut state = self.state.write().await;
        let queue = state
            .queues
            .entry(name.clone())
            .or_insert_with(|| QueueState::new(exclusive));
        if queue.exclusive && queue.consumers > 0 {
            return Err(Error::conflict(format!("queue {} is exclusive", name)));
        }
        let tx = queue.tx.clone();
        let rx = queue.rx.clone();

        if let Some(binding) = spec.binding {
            if !state.bindings.iter().any(|(p, q)| *p == binding && *q == name) {
                tracing::debug!("Bound queue={} to topic={}", name, binding);
                state.bindings.push((binding, name.clone()));
            }
        }

        Ok(Box::new(InMemoryChannel {
            state: self.state.clone(),
            stats: self.stats.clone(),
            queue: name,
            tx,
            rx,
            active: false,
            closed: false,
            exclusive,
            next_tag: 0,
            unacked: HashMap::new(),
        }))
    }
}

// =============================================================================
// InMemoryChannel
// =============================================================================

#[derive(Debug)]
struct InMemoryChannel {
    state: Arc<RwLock<BrokerState>>,
    stats: Arc<RwLock<BrokerStats>>,
    queue: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: SharedReceiver,
    active: bool,
    closed: bool,
    exclusive: bool,
    next_tag: DeliveryTag,
    unacked: HashMap<DeliveryTag, Message>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::channel_closed(format!("listener on {}", self.queue)));
        }
        Ok(())
    }

    async fn requeue(&self, message: Message) {
        if self.tx.send(message).is_ok() {
            self.stats.write().await.messages_requeued += 1;
        }
    }
}

#[async_trait]
impl ListenChannel for InMemoryChannel {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn activate(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.active {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| Error::channel_closed(format!("queue {} was deleted", self.queue)))?;
        queue.consumers += 1;
        self.active = true;
        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        if !self.active {
            return Err(Error::inconsistent(format!(
                "receive on inactive listener {}",
                self.queue
            )));
        }

        let rx = self.rx.clone();
        let next = timeout(wait, async move { rx.lock().await.recv().await }).await;
        match next {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::channel_closed(format!("queue {}", self.queue))),
            Ok(Some(message)) => {
                self.next_tag += 1;
                let tag = self.next_tag;
                self.unacked.insert(tag, message.clone());
                Ok(Some(Delivery { tag, message }))
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("unknown delivery tag: {}", tag)))
    }

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let message = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::not_found(format!("unknown delivery tag: {}", tag)))?;
        if requeue {
            self.requeue(message).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for (_, message) in std::mem::take(&mut self.unacked) {
            self.requeue(message).await;
        }

        let mut state = self.state.write().await;
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            if self.active {
                queue.consumers = queue.consumers.saturating_sub(1);
            }
        }
        if self.exclusive {
            state.queues.remove(&self.queue);
            let name = self.queue.clone();
            state.bindings.retain(|(_, q)| *q != name);
        }

        tracing::debug!("Closed listener on queue={}", self.queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Headers;
    use serde_json::json;

    fn msg(n: i64) -> Message {
        Message::new(json!({ "n": n }), Headers::new())
    }

    async fn active(broker: &InMemoryBroker, spec: ListenerSpec) -> Box<dyn ListenChannel> {
        let mut ch = broker.declare_listener(spec).await.unwrap();
        ch.activate().await.unwrap();
        ch
    }

    const WAIT: Duration = Duration::from_millis(200);

    // =========================================================================
    // Point-to-point
    // =========================================================================

    #[tokio::test]
    async fn test_send_and_receive() {
        let broker = InMemoryBroker::new();
        let mut ch = active(&broker, ListenerSpec::queue("q1")).await;

        broker.send("q1", msg(1)).await.unwrap();
        let delivery = ch.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.message.body["n"], 1);
        ch.ack(delivery.tag).await.unwrap();

        let stats = broker.get_stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.queues, 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let broker = InMemoryBroker::new();
        let mut ch = active(&broker, ListenerSpec::queue("q1")).await;
        assert!(ch.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_before_activate_fails() {
        let broker = InMemoryBroker::new();
        let mut ch = broker.declare_listener(ListenerSpec::queue("q1")).await.unwrap();
        assert!(ch.receive(WAIT).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_buffer_before_activation() {
        let broker = InMemoryBroker::new();
        let mut ch = broker.declare_listener(ListenerSpec::queue("q1")).await.unwrap();
        broker.send("q1", msg(7)).await.unwrap();
        ch.activate().await.unwrap();
        let delivery = ch.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.message.body["n"], 7);
    }

    #[tokio::test]
    async fn test_unroutable_is_dropped() {
        let broker = InMemoryBroker::new();
        broker.send("nobody", msg(1)).await.unwrap();
        assert_eq!(broker.get_stats().await.messages_undeliverable, 1);
    }

    #[tokio::test]
    async fn test_competing_consumers_share_queue() {
        let broker = InMemoryBroker::new();
        let mut a = active(&broker, ListenerSpec::queue("svc")).await;
        let mut b = active(&broker, ListenerSpec::queue("svc")).await;
        assert_eq!(broker.queue_info("svc").await.unwrap().consumers, 2);

        broker.send("svc", msg(1)).await.unwrap();
        broker.send("svc", msg(2)).await.unwrap();

        let first = a.receive(WAIT).await.unwrap();
        let second = b.receive(WAIT).await.unwrap();
        let mut got: Vec<i64> = [first, second]
            .into_iter()
            .flatten()
            .map(|d| d.message.body["n"].as_i64().unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    // =========================================================================
    // Ack / Reject
    // =========================================================================

    #[tokio::test]
    async fn test_reject_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let mut ch = active(&broker, ListenerSpec::queue("q1")).await;
        broker.send("q1", msg(3)).await.unwrap();

        let d = ch.receive(WAIT).await.unwrap().unwrap();
        ch.reject(d.tag, true).await.unwrap();
        let again = ch.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(again.message.body["n"], 3);
        assert_ne!(again.tag, d.tag);

        assert!(ch.ack(d.tag).await.is_err());
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let mut a = active(&broker, ListenerSpec::queue("q1")).await;
        broker.send("q1", msg(5)).await.unwrap();
        let _ = a.receive(WAIT).await.unwrap().unwrap();
        a.close().await.unwrap();
        assert!(a.receive(WAIT).await.is_err());

        let mut b = active(&broker, ListenerSpec::queue("q1")).await;
        let d = b.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(d.message.body["n"], 5);
        assert_eq!(broker.queue_info("q1").await.unwrap().consumers, 1);
    }

    // =========================================================================
    // Topics
    // =========================================================================

    #[tokio::test]
    async fn test_publish_fans_out_per_queue() {
        let broker = InMemoryBroker::new();
        let mut a = active(&broker, ListenerSpec::queue("qa").with_binding("data.#")).await;
        let mut b = active(&broker, ListenerSpec::anonymous().with_binding("data.raw")).await;
        let _c = active(&broker, ListenerSpec::queue("qc").with_binding("other")).await;

        let n = broker.publish("data.raw", msg(9)).await.unwrap();
        assert_eq!(n, 2);
        assert!(a.receive(WAIT).await.unwrap().is_some());
        assert!(b.receive(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_anonymous_queue_removed_on_close() {
        let broker = InMemoryBroker::new();
        let mut ch = active(&broker, ListenerSpec::anonymous().with_binding("t")).await;
        let name = ch.queue_name().to_string();
        assert!(name.starts_with("amq.gen-"));
        ch.close().await.unwrap();
        assert!(broker.queue_info(&name).await.is_none());
        assert_eq!(broker.get_stats().await.bindings, 0);
    }
}
