use std::sync::Arc;
use std::time::Duration;

use wire::headers::MessageHeaders;

use crate::BrokerError;
use crate::hub::BrokerHub;

/// One delivered message. `delivery_tag` and `queue` are enough for a
/// `Consumer` to ack or requeue it without the hub's internals.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub headers: MessageHeaders,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub(crate) queue: String,
}

/// Per-(thread/task) handle onto the shared hub (spec §5: "connections are
/// opened once per consumer/producer task, never shared across tasks").
/// Cheap to clone; cloning is how a worker hands a connection to a new
/// consumer task.
#[derive(Clone)]
pub struct BrokerClient {
    hub: Arc<BrokerHub>,
    heartbeat_interval: Duration,
}

impl BrokerClient {
    pub fn new(hub: Arc<BrokerHub>, heartbeat_interval: Duration) -> Self {
        Self {
            hub,
            heartbeat_interval,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub async fn declare_queue(&self, name: &str, prefetch: usize) {
        self.hub.declare_queue(name, prefetch).await;
    }

    pub async fn declare_direct_exchange(&self, name: &str) {
        self.hub.declare_direct_exchange(name).await;
    }

    pub async fn declare_fanout_exchange(&self, name: &str) {
        self.hub.declare_fanout_exchange(name).await;
    }

    pub async fn bind(&self, exchange: &str, routing_key: Option<&str>, queue: &str) -> Result<(), BrokerError> {
        self.hub.bind(exchange, routing_key, queue).await
    }

    pub async fn publish_to_queue(
        &self,
        queue: &str,
        headers: MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.hub.publish_to_queue(queue, headers, payload).await
    }

    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        headers: MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.hub.publish_to_exchange(exchange, routing_key, headers, payload).await
    }

    pub async fn delete_queue(&self, queue: &str) {
        self.hub.delete_queue(queue).await;
    }

    /// Binds a competing-consumer handle to `queue`. Multiple consumers may
    /// be created for the same queue (e.g. one per replica task); each
    /// delivery goes to exactly one of them.
    pub async fn consumer_for(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let rx = self.hub.receiver_for(queue).await?;
        Ok(Consumer {
            hub: self.hub.clone(),
            queue: queue.to_string(),
            rx,
        })
    }
}

/// Pull-side handle for one queue. `recv` blocks until a message is
/// available; manual ack/nack mirrors spec §5's "no auto-ack" requirement
/// so a crash between delivery and commit never silently drops work.
pub struct Consumer {
    hub: Arc<BrokerHub>,
    queue: String,
    rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Envelope>>>,
}

impl Consumer {
    pub async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    /// No-op on this transport: the hub never tracks unacked deliveries,
    /// since redelivery safety is provided by the WAL dedup set instead.
    /// Kept so call sites read the same as they would against a real
    /// broker client.
    pub async fn ack(&self, _tag: u64) {}

    /// Puts the envelope back on its originating queue when `requeue` is
    /// set; otherwise the message is dropped (spec §7: malformed payloads
    /// are nacked without requeue).
    pub async fn nack(&self, envelope: Envelope, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.hub
                .publish_to_queue(&envelope.queue, envelope.headers, envelope.payload)
                .await
        } else {
            Ok(())
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BrokerHub;
    use uuid::Uuid;

    fn client() -> BrokerClient {
        BrokerClient::new(BrokerHub::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn direct_exchange_routes_only_to_the_bound_key() {
        let client = client();
        client.declare_direct_exchange("stage.exchange").await;
        client.declare_queue("stage_0", 8).await;
        client.declare_queue("stage_1", 8).await;
        client.bind("stage.exchange", Some("stage_0"), "stage_0").await.unwrap();
        client.bind("stage.exchange", Some("stage_1"), "stage_1").await.unwrap();

        let headers = MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4());
        client
            .publish_to_exchange("stage.exchange", Some("stage_1"), headers, b"payload".to_vec())
            .await
            .unwrap();

        let c0 = client.consumer_for("stage_0").await.unwrap();
        let c1 = client.consumer_for("stage_1").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), c0.recv())
                .await
                .is_err()
        );
        let delivered = c1.recv().await.unwrap();
        assert_eq!(delivered.payload, b"payload");
    }

    #[tokio::test]
    async fn fanout_exchange_reaches_every_bound_queue() {
        let client = client();
        client.declare_fanout_exchange("eof.fanout").await;
        client.declare_queue("worker_0", 8).await;
        client.declare_queue("worker_1", 8).await;
        client.bind("eof.fanout", None, "worker_0").await.unwrap();
        client.bind("eof.fanout", None, "worker_1").await.unwrap();

        let headers = MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4());
        client
            .publish_to_exchange("eof.fanout", None, headers, b"eof".to_vec())
            .await
            .unwrap();

        let c0 = client.consumer_for("worker_0").await.unwrap();
        let c1 = client.consumer_for("worker_1").await.unwrap();
        assert_eq!(c0.recv().await.unwrap().payload, b"eof");
        assert_eq!(c1.recv().await.unwrap().payload, b"eof");
    }

    #[tokio::test]
    async fn rebinding_the_same_queue_and_key_does_not_duplicate_delivery() {
        let client = client();
        client.declare_direct_exchange("stage.exchange").await;
        client.declare_queue("stage_0", 8).await;
        // Both a producer and a consumer routinely declare the same
        // topology before either knows whether the other already has.
        client.bind("stage.exchange", Some("stage_0"), "stage_0").await.unwrap();
        client.bind("stage.exchange", Some("stage_0"), "stage_0").await.unwrap();

        let headers = MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4());
        client
            .publish_to_exchange("stage.exchange", Some("stage_0"), headers, b"once".to_vec())
            .await
            .unwrap();

        let consumer = client.consumer_for("stage_0").await.unwrap();
        assert_eq!(consumer.recv().await.unwrap().payload, b"once");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), consumer.recv())
                .await
                .is_err(),
            "the duplicate bind must not deliver the message a second time"
        );
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_the_message() {
        let client = client();
        client.declare_queue("q", 4).await;
        let headers = MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4());
        client.publish_to_queue("q", headers, b"once".to_vec()).await.unwrap();

        let consumer = client.consumer_for("q").await.unwrap();
        let first = consumer.recv().await.unwrap();
        consumer.nack(first, true).await.unwrap();

        let redelivered = consumer.recv().await.unwrap();
        assert_eq!(redelivered.payload, b"once");
    }

    #[tokio::test]
    async fn deleting_a_queue_disconnects_its_publishers() {
        let client = client();
        client.declare_queue("q", 4).await;
        client.delete_queue("q").await;

        let headers = MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4());
        let err = client.publish_to_queue("q", headers, vec![]).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }
}
