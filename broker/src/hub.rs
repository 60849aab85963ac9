use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use wire::headers::MessageHeaders;

use crate::BrokerError;
use crate::client::Envelope;

enum ExchangeKind {
    /// Routes to the queues bound under the message's exact routing key
    /// (spec §4.A per-partition queues, e.g. `<stage>_<replica_index>`).
    Direct(HashMap<String, Vec<String>>),
    /// Routes to every bound queue regardless of routing key (spec §4.A
    /// WorkerEOF fan-out and reference-data broadcast).
    Fanout(Vec<String>),
}

struct QueueState {
    tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

/// The in-process stand-in for the broker transport (spec §14 Q-BROKER):
/// no real AMQP connection is opened, but the publish/bind/consume/ack
/// surface is the one a real client would expose, so `runtime` is written
/// against an interface rather than a transport.
///
/// Queue capacity doubles as the prefetch bound (spec §5 backpressure):
/// a full queue makes `publish` wait, which is how saturation on one
/// stage propagates backpressure to the stage feeding it.
pub struct BrokerHub {
    queues: Mutex<HashMap<String, QueueState>>,
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    next_delivery_tag: AtomicU64,
}

impl BrokerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            next_delivery_tag: AtomicU64::new(1),
        })
    }

    pub async fn declare_queue(&self, name: &str, prefetch: usize) {
        let mut guard = self.queues.lock().await;
        if !guard.contains_key(name) {
            let (tx, rx) = mpsc::channel(prefetch.max(1));
            guard.insert(
                name.to_string(),
                QueueState {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                },
            );
        }
    }

    pub async fn declare_direct_exchange(&self, name: &str) {
        let mut guard = self.exchanges.lock().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| ExchangeKind::Direct(HashMap::new()));
    }

    pub async fn declare_fanout_exchange(&self, name: &str) {
        let mut guard = self.exchanges.lock().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| ExchangeKind::Fanout(Vec::new()));
    }

    /// Binds `queue` to `exchange`, under `routing_key` for a direct
    /// exchange. Idempotent, matching real AMQP brokers: both a consumer
    /// and a producer routinely declare the same topology defensively
    /// (whichever starts first shouldn't have to know), so re-binding an
    /// already-bound queue is a no-op rather than a second delivery path.
    pub async fn bind(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        queue: &str,
    ) -> Result<(), BrokerError> {
        let mut guard = self.exchanges.lock().await;
        let kind = guard
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        match kind {
            ExchangeKind::Direct(bindings) => {
                let key = routing_key
                    .ok_or_else(|| BrokerError::Message("direct exchange requires a routing key".into()))?;
                let queues = bindings.entry(key.to_string()).or_default();
                if !queues.iter().any(|q| q == queue) {
                    queues.push(queue.to_string());
                }
            }
            ExchangeKind::Fanout(bound) => {
                if !bound.iter().any(|q| q == queue) {
                    bound.push(queue.to_string());
                }
            }
        }
        Ok(())
    }

    pub async fn publish_to_queue(
        &self,
        queue: &str,
        headers: MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let tx = {
            let guard = self.queues.lock().await;
            guard
                .get(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
                .tx
                .clone()
        };
        let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
        tx.send(Envelope {
            headers,
            payload,
            delivery_tag: tag,
            queue: queue.to_string(),
        })
        .await
        .map_err(|_| BrokerError::Disconnected(queue.to_string()))
    }

    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        headers: MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let targets = {
            let guard = self.exchanges.lock().await;
            let kind = guard
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            match kind {
                ExchangeKind::Direct(bindings) => routing_key
                    .and_then(|key| bindings.get(key))
                    .cloned()
                    .unwrap_or_default(),
                ExchangeKind::Fanout(bound) => bound.clone(),
            }
        };

        for queue in targets {
            self.publish_to_queue(&queue, headers.clone(), payload.clone()).await?;
        }
        Ok(())
    }

    pub(crate) async fn receiver_for(&self, queue: &str) -> Result<Arc<Mutex<mpsc::Receiver<Envelope>>>, BrokerError> {
        let guard = self.queues.lock().await;
        guard
            .get(queue)
            .map(|q| q.rx.clone())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    /// Deletes a queue. Spec §4.D: flushing a session removes both its
    /// durable storage and any queue created solely to fan messages into it.
    pub async fn delete_queue(&self, queue: &str) {
        self.queues.lock().await.remove(queue);
    }
}
