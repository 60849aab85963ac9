use sha2::{Digest, Sha256};
use wire::entities::Transaction;

use crate::{Operator, Step};

/// Passthrough operator used purely to hang a non-default routing function
/// off a stage's output declaration (spec §4.F Router). The actual
/// partitioning happens in the routing functions below, applied by the
/// worker base to every outbound message; the operator itself never
/// inspects the routing key.
pub struct Router<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static> Operator for Router<T> {
    type Session = ();
    type Delta = ();
    type Input = T;
    type Output = T;

    fn session_data_type(&self) -> &'static str {
        "router::()"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::row(entity)
    }

    fn apply_delta(&self, _session: &mut Self::Session, _delta: &Self::Delta) {}

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }
}

/// Identity passthrough for `Transaction`, declared with a `tx_router`
/// output ahead of the purchase-count aggregator so every transaction for a
/// given `(user_id, store_id)` pair lands on the same replica (spec §4.E,
/// required for Q4 correctness).
#[derive(Default)]
pub struct TxRouterOperator;

impl Operator for TxRouterOperator {
    type Session = ();
    type Delta = ();
    type Input = Transaction;
    type Output = Transaction;

    fn session_data_type(&self) -> &'static str {
        "router::TxRouterOperator"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::row(entity)
    }

    fn apply_delta(&self, _session: &mut Self::Session, _delta: &Self::Delta) {}

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }

    fn tx_route_key(&self, output: &Self::Output) -> Option<(u32, u32)> {
        output.user_id.map(|user_id| (user_id, output.store_id))
    }
}

/// `default`: hashes `message_id mod downstream_workers` onto
/// `"<downstream_stage>_<k>"` (spec §4.E).
pub fn default_route(message_id: uuid::Uuid, downstream_stage: &str, downstream_workers: usize) -> String {
    let k = (message_id.as_u128() % downstream_workers.max(1) as u128) as usize;
    format!("{downstream_stage}_{k}")
}

/// `by_stage_name`: returns the stage name verbatim — used by sinks
/// publishing to the results exchange keyed by query ID (spec §4.E, §4.H).
pub fn by_stage_name(downstream_stage: &str) -> String {
    downstream_stage.to_string()
}

/// `tx_router`: SHA-256 of `(user_id, store_id)` pins every transaction of
/// one (user, store) pair to the same downstream replica — required for Q4
/// correctness, since the purchase-count aggregator must see every
/// transaction for a given user at a given store in one place (spec §4.E).
pub fn tx_router(user_id: u32, store_id: u32, downstream_stage: &str, downstream_workers: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.to_be_bytes());
    hasher.update(store_id.to_be_bytes());
    let digest = hasher.finalize();
    let as_u64 = u64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest is at least 8 bytes"));
    let k = (as_u64 % downstream_workers.max(1) as u64) as usize;
    format!("{downstream_stage}_{k}")
}

/// `broadcast`: reference-data fanout reaches every replica via the
/// shared `"common"` routing key (spec §4.E).
pub fn broadcast() -> &'static str {
    "common"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_router_is_stable_for_the_same_pair() {
        let a = tx_router(42, 7, "agg", 4);
        let b = tx_router(42, 7, "agg", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn tx_router_can_disagree_across_pairs() {
        let routes: std::collections::HashSet<String> =
            (0..16).map(|store_id| tx_router(1, store_id, "agg", 4)).collect();
        assert!(routes.len() > 1, "expected routing to spread across partitions");
    }
}
