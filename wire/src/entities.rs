use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coffee shop location, joined into transactions via `store_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub store_id: u32,
    pub store_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: u32,
    pub birthdate: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub item_id: u32,
    pub item_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub store_id: u32,
    pub user_id: Option<u32>,
    pub final_amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub item_id: u32,
    pub quantity: u32,
    pub subtotal: f64,
    pub created_at: DateTime<Utc>,
}

/// A `Transaction` after the reference-small (stores) join; carries the
/// store's name alongside it so the semester/store aggregator never needs
/// its own copy of the store table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTransaction {
    pub id: String,
    pub store_id: u32,
    pub store_name: String,
    pub user_id: Option<u32>,
    pub final_amount: f64,
    pub created_at: DateTime<Utc>,
}

/// A `TransactionItem` after the reference-small (menu_items) join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTransactionItem {
    pub item_id: u32,
    pub item_name: String,
    pub quantity: u32,
    pub subtotal: f64,
    pub created_at: DateTime<Utc>,
}

/// Running per-(store, user) purchase tally, computed straight off the
/// transaction stream before the Q4 reference-large join attaches
/// birthdate/store_name (spec §4.F reference-large flow).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorePurchaseCounts {
    pub stores: HashMap<u32, HashMap<u32, u64>>,
}

/// Running per-(period, item) aggregate maintained by the period/item
/// aggregator (spec §4.F) and merged across replicas for Q2.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPeriodStats {
    pub quantity: u64,
    pub amount: f64,
    pub item_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionItemByPeriod {
    pub periods: HashMap<String, HashMap<u32, ItemPeriodStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreTpvStats {
    pub store_name: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemesterTpvByStore {
    pub semesters: HashMap<String, HashMap<u32, StoreTpvStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPurchaseStats {
    pub purchases: u64,
    pub birthday: DateTime<Utc>,
    pub store_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPurchasesByStore {
    pub stores: HashMap<u32, HashMap<u32, UserPurchaseStats>>,
}

/// Marks the end of one upstream replica's contribution to a session.
/// Carries no payload; its presence on the wire is what matters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eof;

/// Intra-stage fan-in marker: "replica `worker_id` has seen EOF from all of
/// its own upstreams". Distinct from `Eof`, which travels stage-to-stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEof {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub container_name: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HcHeartbeat {
    pub hc_id: u32,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HcElection {
    pub hc_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HcOk {
    pub hc_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HcCoordinator {
    pub hc_id: u32,
}

/// A session-scoped correlation id threaded through every broker message
/// header (spec §3 invariant 1). Assigned once, by the gateway.
pub type SessionId = Uuid;

/// Per-message id used for dedup (spec §3 invariant 2, §4.C).
pub type MessageId = Uuid;
