pub mod aggregator;
pub mod enricher;
pub mod filter;
pub mod merger;
pub mod router;
pub mod sink;
pub mod transformer;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// What one call to `on_entity_upstream` produced: at most one WAL delta to
/// persist, plus zero-or-more rows ready for the output buffer. Filters and
/// transformers only ever fill `rows`; aggregators only ever fill `delta`;
/// a joiner that just became able to enrich a buffered row can fill both.
pub struct Step<D, O> {
    pub delta: Option<D>,
    pub rows: Vec<O>,
}

impl<D, O> Step<D, O> {
    pub fn none() -> Self {
        Self {
            delta: None,
            rows: Vec::new(),
        }
    }

    pub fn delta(delta: D) -> Self {
        Self {
            delta: Some(delta),
            rows: Vec::new(),
        }
    }

    pub fn row(row: O) -> Self {
        Self {
            delta: None,
            rows: vec![row],
        }
    }

    pub fn rows(rows: Vec<O>) -> Self {
        Self { delta: None, rows }
    }
}

/// The single strategy interface every stage runtime drives. Keeping
/// `Session`/`Delta`/`Input`/`Output` as associated types (rather than
/// generic parameters on the worker base) means the base never needs to
/// know a concrete operator's accumulator shape; `runtime` is generic over
/// one `O: Operator` per stage binary instead of over every operator kind
/// at once.
///
/// Operator logic is synchronous and CPU-only by contract (spec §5): no
/// method here is async, and none may perform I/O.
pub trait Operator: Send + Sync + 'static {
    /// Operator-specific accumulator, durable via `storage::WalStore`.
    type Session: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Operator-specific WAL delta, folded into `Session` by `apply_delta`.
    type Delta: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Input: DeserializeOwned + Send + Sync + 'static;
    type Output: Clone + Serialize + Send + Sync + 'static;

    /// Human-readable accumulator name, surfaced in logs and metrics.
    fn session_data_type(&self) -> &'static str;

    /// Runs once when a session_id is seen for the first time.
    fn start_of_session(&self, _session: &Uuid) {}

    /// Folds one upstream entity into a delta and/or emits rows directly.
    fn on_entity_upstream(&self, session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output>;

    /// Applies a previously-recorded delta to the live accumulator. Called
    /// both on the live path and during WAL replay, so it must be a pure
    /// fold with no side effects.
    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta);

    /// Called after an upstream batch has been fully folded in, in case the
    /// operator wants to flush partial output early (buffering is the
    /// runtime's job; this is for operators like the enricher that unblock
    /// buffered rows once a reference set becomes available).
    fn after_batch_processed(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }

    /// Runs exactly once, when the session becomes flushable (spec §3
    /// invariant 5). Most aggregators emit the whole accumulator here.
    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output>;

    /// Extracts the `(user_id, store_id)` key an output row should be
    /// partitioned on for a `tx_router`-routed output (spec §4.E). Only the
    /// stage feeding the Q4 purchase-count aggregator needs this; every
    /// other operator leaves the default and is simply never declared with
    /// that routing function.
    fn tx_route_key(&self, _output: &Self::Output) -> Option<(u32, u32)> {
        None
    }

    /// Decodes a batch row arriving on the stage's primary consumer. The
    /// default is a plain deserialize into `Input`; joiners override this
    /// (and `decode_reference`) to wrap the two sides of a join into their
    /// `EnricherInput` variants instead.
    fn decode_main(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decodes a batch row arriving on the stage's reference-data consumer.
    /// Unused by operators with no second input stream.
    fn decode_reference(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
