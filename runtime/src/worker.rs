use std::collections::HashMap;
use std::sync::Arc;

use broker::{BrokerClient, Consumer};
use operators::Operator;
use sessions::SessionManager;
use storage::WalStore;
use tokio::sync::Mutex;
use uuid::Uuid;
use wire::codec::Batch;
use wire::entities::WorkerEof;

use crate::config::WorkerConfig;
use crate::output::OutputFanout;
use crate::shutdown::Shutdown;
use crate::RuntimeError;

/// Per-session divert state for stages with a reference input (spec §4.F /
/// §9 ordering gate): until this session's reference table is known fully
/// loaded, main-stream rows are queued here instead of reaching the
/// operator, since a lookup against a partially-loaded table would silently
/// drop rows that arrived too early.
#[derive(Default)]
struct ReferenceGate {
    ready: bool,
    pending: Vec<Vec<serde_json::Value>>,
}

/// Runs one stage replica: consumes its primary input, optionally a
/// reference-data stream, and its stage's intra-fanout control channel, and
/// drives one `O: Operator` against durable per-session state.
pub struct StageWorker<O: Operator> {
    config: WorkerConfig,
    operator: Arc<O>,
    client: BrokerClient,
    sessions: Arc<SessionManager<O::Session, O::Delta>>,
    fanout: Arc<OutputFanout<O>>,
    shutdown: Shutdown,
    reference_gates: Mutex<HashMap<Uuid, ReferenceGate>>,
}

impl<O: Operator> StageWorker<O> {
    pub async fn new(
        config: WorkerConfig,
        operator: O,
        client: BrokerClient,
        shutdown: Shutdown,
    ) -> Result<Self, RuntimeError> {
        let operator = Arc::new(operator);
        let reducer = operator.clone();
        let store = WalStore::<O::Session, O::Delta>::new(
            config.wal_dir.clone(),
            config.snapshot_threshold,
            move |session: &mut O::Session, delta: &O::Delta| reducer.apply_delta(session, delta),
        )
        .await?;
        let sessions = Arc::new(SessionManager::new(store).await?);
        let fanout = Arc::new(OutputFanout::new(client.clone(), config.outputs.clone(), config.buffer_size));

        Ok(Self {
            config,
            operator,
            client,
            sessions,
            fanout,
            shutdown,
            reference_gates: Mutex::new(HashMap::new()),
        })
    }

    /// True once this session's reference table is known complete, or
    /// trivially true for a stage with no reference input at all (spec §9).
    async fn reference_ready(&self, session_id: Uuid) -> bool {
        if self.config.enricher_exchange.is_none() {
            return true;
        }
        self.reference_gates
            .lock()
            .await
            .get(&session_id)
            .map(|gate| gate.ready)
            .unwrap_or(false)
    }

    /// Diverts main-stream rows into this session's queue instead of
    /// folding them, because the reference side hasn't reported its EOF yet.
    async fn defer_main_rows(&self, session_id: Uuid, rows: Vec<serde_json::Value>) {
        self.reference_gates.lock().await.entry(session_id).or_default().pending.push(rows);
    }

    /// Marks a session's reference table complete and drains whatever
    /// main-stream rows queued up while it was still loading, in arrival
    /// order (spec §9). Idempotent: a reference source with more than one
    /// replica broadcasts its own EOF once each, and only the first should
    /// trigger a drain.
    async fn open_reference_gate(&self, session_id: Uuid) -> Result<(), RuntimeError> {
        let pending = {
            let mut guard = self.reference_gates.lock().await;
            let gate = guard.entry(session_id).or_default();
            if gate.ready {
                return Ok(());
            }
            gate.ready = true;
            std::mem::take(&mut gate.pending)
        };

        for rows in pending {
            self.fold_batch(session_id, rows, false).await?;
        }
        self.fanout.flush_pending().await?;
        Ok(())
    }

    fn reference_queue(&self) -> String {
        format!("{}__ref", self.config.own_routing_key())
    }

    fn intra_queue(&self) -> String {
        format!("{}__intra", self.config.own_routing_key())
    }

    async fn declare(&self) -> Result<(), RuntimeError> {
        let own_queue = self.config.own_routing_key();
        self.client.declare_direct_exchange(&self.config.from_exchange).await;
        self.client.declare_queue(&own_queue, self.config.broker_prefetch).await;
        self.client.bind(&self.config.from_exchange, Some(&own_queue), &own_queue).await?;

        // `by_stage_name` routing addresses a stage by its bare name, which
        // only makes sense for single-instance stages (sinks): the leader
        // replica's queue answers to both keys so either upstream
        // convention reaches it.
        if self.config.is_leader() {
            self.client
                .bind(&self.config.from_exchange, Some(&self.config.stage_name), &own_queue)
                .await?;
        }

        self.client.declare_fanout_exchange(&self.config.intra_stage_exchange()).await;
        let intra_queue = self.intra_queue();
        self.client.declare_queue(&intra_queue, 128).await;
        self.client.bind(&self.config.intra_stage_exchange(), None, &intra_queue).await?;

        if let Some(enricher_exchange) = &self.config.enricher_exchange {
            self.client.declare_fanout_exchange(enricher_exchange).await;
            let ref_queue = self.reference_queue();
            self.client.declare_queue(&ref_queue, self.config.broker_prefetch).await;
            self.client.bind(enricher_exchange, None, &ref_queue).await?;
        }

        self.fanout.declare().await;
        Ok(())
    }

    pub async fn run(self: Arc<Self>) -> Result<(), RuntimeError> {
        self.declare().await?;

        let mut tasks = Vec::new();

        let intra_consumer = self.client.consumer_for(&self.intra_queue()).await?;
        tasks.push(tokio::spawn(self.clone().run_intra_loop(intra_consumer)));

        if self.config.enricher_exchange.is_some() {
            let ref_consumer = self.client.consumer_for(&self.reference_queue()).await?;
            tasks.push(tokio::spawn(self.clone().run_reference_loop(ref_consumer)));
        }

        let main_consumer = self.client.consumer_for(&self.config.own_routing_key()).await?;
        tasks.push(tokio::spawn(self.clone().run_main_loop(main_consumer)));

        self.shutdown.listen().await;

        for task in tasks {
            let _ = task.await;
        }

        self.sessions.save_sessions().await?;
        Ok(())
    }

    async fn run_main_loop(self: Arc<Self>, consumer: Consumer) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                envelope = consumer.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = self.handle_main_message(&consumer, envelope).await {
                        tracing::error!(stage = %self.config.stage_name, error = %e, "failed to process message");
                    }
                }
            }
        }
    }

    async fn run_reference_loop(self: Arc<Self>, consumer: Consumer) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                envelope = consumer.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = self.handle_reference_message(&consumer, envelope).await {
                        tracing::error!(stage = %self.config.stage_name, error = %e, "failed to process reference message");
                    }
                }
            }
        }
    }

    async fn run_intra_loop(self: Arc<Self>, consumer: Consumer) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                envelope = consumer.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = self.handle_intra_message(&consumer, envelope).await {
                        tracing::error!(stage = %self.config.stage_name, error = %e, "failed to process control message");
                    }
                }
            }
        }
    }

    /// Per-message dispatch for the primary input (spec §4.E): dedup, fold
    /// into the operator, WAL-commit, ack. EOF on this stream means one
    /// upstream worker finished; it is relayed onto the intra exchange so
    /// every sibling replica's own `eof_collected` advances together.
    async fn handle_main_message(&self, consumer: &Consumer, envelope: broker::Envelope) -> Result<(), RuntimeError> {
        let session_id = envelope
            .headers
            .session_id()
            .ok_or_else(|| RuntimeError::Malformed("missing SESSION_ID header".into()))?;
        let message_id = envelope
            .headers
            .message_id()
            .ok_or_else(|| RuntimeError::Malformed("missing MESSAGE_ID header".into()))?;

        if self.sessions.get_or_initialize(session_id).await {
            self.operator.start_of_session(&session_id);
        }

        let duplicate = self
            .sessions
            .with_session(session_id, |s| s.is_duplicate(message_id))
            .await
            .unwrap_or(false);
        if duplicate {
            consumer.ack(envelope.delivery_tag).await;
            return Ok(());
        }

        let batch: Batch<serde_json::Value> = match Batch::decode(&envelope.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "malformed batch payload, dropping without requeue");
                consumer.nack(envelope, false).await?;
                return Ok(());
            }
        };

        self.sessions.with_session(session_id, |s| s.record_msg(message_id)).await;

        if batch.eof {
            self.record_and_relay_eof(session_id).await?;
        } else if self.reference_ready(session_id).await {
            self.fold_batch(session_id, batch.rows, false).await?;
            self.fanout.flush_pending().await?;
        } else {
            self.defer_main_rows(session_id, batch.rows).await;
        }

        self.sessions.commit(session_id, message_id).await?;
        consumer.ack(envelope.delivery_tag).await;

        // A session can't be complete while rows are still queued behind
        // its reference gate, even if its EOFs are otherwise all in — the
        // gate opening is what drives the deferred `try_flush` once drained.
        if self.reference_ready(session_id).await {
            self.try_flush(session_id).await?;
        }
        Ok(())
    }

    /// Reference-data messages never carry their own session (spec §4.F:
    /// reference streams are broadcast once per query run, not per upstream
    /// session), so they key off the session id already present in the
    /// session's own header and are folded the same way as main-stream
    /// entities, just wrapped through `decode_reference`. The stream's own
    /// EOF opens this session's reference gate (spec §9), releasing any
    /// main-stream rows that arrived too early to be enriched.
    async fn handle_reference_message(&self, consumer: &Consumer, envelope: broker::Envelope) -> Result<(), RuntimeError> {
        let session_id = envelope
            .headers
            .session_id()
            .ok_or_else(|| RuntimeError::Malformed("missing SESSION_ID header".into()))?;
        let message_id = envelope
            .headers
            .message_id()
            .ok_or_else(|| RuntimeError::Malformed("missing MESSAGE_ID header".into()))?;

        if self.sessions.get_or_initialize(session_id).await {
            self.operator.start_of_session(&session_id);
        }

        let duplicate = self
            .sessions
            .with_session(session_id, |s| s.is_duplicate(message_id))
            .await
            .unwrap_or(false);
        if duplicate {
            consumer.ack(envelope.delivery_tag).await;
            return Ok(());
        }

        let batch: Batch<serde_json::Value> = match Batch::decode(&envelope.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "malformed reference payload, dropping without requeue");
                consumer.nack(envelope, false).await?;
                return Ok(());
            }
        };

        self.sessions.with_session(session_id, |s| s.record_msg(message_id)).await;

        if batch.eof {
            self.open_reference_gate(session_id).await?;
        } else {
            self.fold_batch(session_id, batch.rows, true).await?;
            self.fanout.flush_pending().await?;
        }

        self.sessions.commit(session_id, message_id).await?;
        consumer.ack(envelope.delivery_tag).await;

        if batch.eof {
            self.try_flush(session_id).await?;
        }
        Ok(())
    }

    async fn fold_batch(&self, session_id: Uuid, rows: Vec<serde_json::Value>, reference: bool) -> Result<(), RuntimeError> {
        for row in rows {
            let bytes = serde_json::to_vec(&row)?;
            let entity: O::Input = if reference {
                self.operator.decode_reference(&bytes)
            } else {
                self.operator.decode_main(&bytes)
            }
            .map_err(|e| RuntimeError::Malformed(e.to_string()))?;

            let snapshot = self
                .sessions
                .with_session(session_id, |s| s.storage.clone())
                .await
                .ok_or_else(|| RuntimeError::Malformed("session vanished mid-batch".into()))?;

            let step = self.operator.on_entity_upstream(&snapshot, entity);
            if let Some(delta) = step.delta {
                self.sessions.apply_delta(session_id, delta).await;
            }
            for row in step.rows {
                self.fanout.push(&self.operator, row).await?;
            }
        }

        let after_batch_rows = self
            .sessions
            .with_session(session_id, |s| s.storage.clone())
            .await
            .map(|snapshot| self.operator.after_batch_processed(&snapshot))
            .unwrap_or_default();
        for row in after_batch_rows {
            self.fanout.push(&self.operator, row).await?;
        }
        Ok(())
    }

    async fn record_and_relay_eof(&self, session_id: Uuid) -> Result<(), RuntimeError> {
        let worker_id = self.config.own_routing_key();
        self.sessions.with_session(session_id, |s| s.record_eof(&worker_id)).await;

        let headers = wire::headers::MessageHeaders::new(session_id, Uuid::new_v4());
        let payload = serde_json::to_vec(&WorkerEof { worker_id })?;
        self.client
            .publish_to_exchange(&self.config.intra_stage_exchange(), None, headers, payload)
            .await?;
        Ok(())
    }

    /// A sibling replica's relayed EOF marker (spec §4.E intra-stage
    /// fan-in): fold it into this replica's own `eof_collected` and, once
    /// every configured output's downstream has been told, let `try_flush`
    /// decide whether the session is now complete.
    async fn handle_intra_message(&self, consumer: &Consumer, envelope: broker::Envelope) -> Result<(), RuntimeError> {
        let session_id = envelope
            .headers
            .session_id()
            .ok_or_else(|| RuntimeError::Malformed("missing SESSION_ID header".into()))?;

        let marker: WorkerEof = serde_json::from_slice(&envelope.payload)?;
        if self.sessions.get_or_initialize(session_id).await {
            self.operator.start_of_session(&session_id);
        }
        self.sessions
            .with_session(session_id, |s| s.record_eof(&marker.worker_id))
            .await;
        self.sessions.commit(session_id, Uuid::new_v4()).await?;
        consumer.ack(envelope.delivery_tag).await;

        if self.reference_ready(session_id).await {
            self.try_flush(session_id).await?;
        }
        Ok(())
    }

    /// Flushability differs by role (spec §4.D): the leader only completes
    /// once every replica of this stage has relayed its own upstream EOF
    /// (`replica_count` markers); a follower only needs to have seen its own
    /// relay land back (1), since the leader is the one responsible for
    /// emitting the single downstream EOF once flushed.
    async fn try_flush(&self, session_id: Uuid) -> Result<(), RuntimeError> {
        let required = if self.config.is_leader() { self.config.replica_count } else { 1 };
        if let Some(session) = self.sessions.try_to_flush(session_id, required).await? {
            self.reference_gates.lock().await.remove(&session_id);

            let rows = self.operator.end_of_session(&session.storage);
            for row in rows {
                self.fanout.push(&self.operator, row).await?;
            }
            self.fanout.flush_pending().await?;

            if self.config.is_leader() {
                self.fanout.send_eof(session_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use broker::BrokerHub;
    use chrono::Utc;
    use operators::enricher::StoreEnricher;
    use wire::entities::{Store, Transaction};

    use super::*;
    use crate::config::{OutputSpec, RoutingFn};

    fn enricher_config(wal_dir: std::path::PathBuf) -> WorkerConfig {
        WorkerConfig {
            stage_name: "enricher_store".into(),
            module_name: "enricher_store".into(),
            replica_id: 0,
            replica_count: 1,
            from_exchange: "raw_tx".into(),
            outputs: vec![OutputSpec {
                exchange: "enriched_tx".into(),
                downstream_stage: "sink_q1".into(),
                downstream_workers: 1,
                routing_fn: RoutingFn::Default,
            }],
            enricher_exchange: Some("ref_store".into()),
            wal_dir,
            snapshot_threshold: 100,
            buffer_size: 10,
            broker_prefetch: 50,
            heartbeat_interval_secs: 120,
        }
    }

    /// Reproduces the §9 ordering hazard directly: a transaction for a
    /// store arrives and is acked *before* that store's own reference row
    /// does. Without the reference gate this transaction would hit
    /// `StoreEnricher`'s `None` arm and be dropped for good; with it, the
    /// row is queued and enriched once the reference side's EOF lands.
    #[tokio::test]
    async fn main_row_ahead_of_its_reference_is_queued_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(120));
        let shutdown = Shutdown::new();
        let config = enricher_config(dir.path().to_path_buf());

        let worker = Arc::new(
            StageWorker::new(config, StoreEnricher, client.clone(), shutdown.clone())
                .await
                .unwrap(),
        );
        // Declare up front so the publishes below don't race the
        // background run() loop's own (idempotent) declare call.
        worker.declare().await.unwrap();

        let run_task = tokio::spawn(worker.clone().run());

        let session_id = Uuid::new_v4();
        let tx = Transaction {
            id: "t1".into(),
            store_id: 7,
            user_id: Some(1),
            final_amount: 12.5,
            created_at: Utc::now(),
        };

        // Main row first, while the reference side is still empty.
        client
            .publish_to_exchange(
                "raw_tx",
                Some("enricher_store_0"),
                wire::headers::MessageHeaders::new(session_id, Uuid::new_v4()),
                Batch::rows(vec![serde_json::to_value(&tx).unwrap()]).encode().unwrap(),
            )
            .await
            .unwrap();

        // Give the main loop a chance to process (and, pre-fix, drop) the
        // row before the reference side ever shows up.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let store = Store {
            store_id: 7,
            store_name: "Downtown".into(),
        };
        client
            .publish_to_exchange(
                "ref_store",
                None,
                wire::headers::MessageHeaders::new(session_id, Uuid::new_v4()),
                Batch::rows(vec![serde_json::to_value(&store).unwrap()]).encode().unwrap(),
            )
            .await
            .unwrap();
        client
            .publish_to_exchange(
                "ref_store",
                None,
                wire::headers::MessageHeaders::new(session_id, Uuid::new_v4()),
                Batch::<serde_json::Value>::eof().encode().unwrap(),
            )
            .await
            .unwrap();

        client
            .publish_to_exchange(
                "raw_tx",
                Some("enricher_store_0"),
                wire::headers::MessageHeaders::new(session_id, Uuid::new_v4()),
                Batch::<serde_json::Value>::eof().encode().unwrap(),
            )
            .await
            .unwrap();

        let sink_queue = client.consumer_for("sink_q1_0").await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), sink_queue.recv())
            .await
            .expect("enriched row must be delivered once the reference side arrives")
            .unwrap();
        let batch: Batch<serde_json::Value> = Batch::decode(&delivered.payload).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0]["store_name"], "Downtown");

        run_task.abort();
    }
}
