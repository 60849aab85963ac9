use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wire::entities::{
    EnrichedTransaction, EnrichedTransactionItem, MenuItem, Store, StorePurchaseCounts, Transaction,
    TransactionItem, User, UserPurchaseStats, UserPurchasesByStore,
};

use crate::{Operator, Step};

/// Either side of a join: the reference table (small: loaded whole off a
/// fanout exchange; large: an aggregated partial) or one row of the main
/// stream waiting to be enriched (spec §4.F Joiner/Enricher).
///
/// The runtime's per-session reference gate (spec §9) queues `Main` rows
/// that arrive before this session's reference side has reported its EOF
/// and drains them only once it has, so every `Main` row this operator
/// actually sees can assume its session's `Reference` rows are already
/// folded in. Enrichment is therefore a synchronous lookup, never a wait.
///
/// The runtime never decodes a wire payload directly into this type — it
/// knows which of the two consumers (reference or main) a batch arrived
/// on and constructs the matching variant itself. The `Deserialize` impl
/// exists only to satisfy `Operator::Input`'s bound.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnricherInput<R, M> {
    Reference(R),
    Main(M),
}

#[derive(Clone, Serialize, Deserialize)]
pub enum EnricherDelta<R> {
    Reference(R),
}

/// Reference-small: joins `Transaction` against the full `Store` table.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct StoreEnricherState {
    stores: HashMap<u32, String>,
}

pub struct StoreEnricher;

impl Operator for StoreEnricher {
    type Session = StoreEnricherState;
    type Delta = EnricherDelta<Store>;
    type Input = EnricherInput<Store, Transaction>;
    type Output = EnrichedTransaction;

    fn session_data_type(&self) -> &'static str {
        "enricher::StoreEnricherState"
    }

    fn on_entity_upstream(&self, session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        match entity {
            EnricherInput::Reference(store) => Step::delta(EnricherDelta::Reference(store)),
            EnricherInput::Main(tx) => match session.stores.get(&tx.store_id) {
                Some(store_name) => Step::row(EnrichedTransaction {
                    id: tx.id,
                    store_id: tx.store_id,
                    store_name: store_name.clone(),
                    user_id: tx.user_id,
                    final_amount: tx.final_amount,
                    created_at: tx.created_at,
                }),
                None => {
                    tracing::warn!(store_id = tx.store_id, "transaction references unknown store, dropping");
                    Step::none()
                }
            },
        }
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let EnricherDelta::Reference(store) = delta;
        session.stores.insert(store.store_id, store.store_name.clone());
    }

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }

    fn decode_main(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<Transaction>(bytes).map(EnricherInput::Main)
    }

    fn decode_reference(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<Store>(bytes).map(EnricherInput::Reference)
    }
}

/// Reference-small: joins `TransactionItem` against the full `MenuItem`
/// table.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct MenuEnricherState {
    items: HashMap<u32, String>,
}

pub struct MenuEnricher;

impl Operator for MenuEnricher {
    type Session = MenuEnricherState;
    type Delta = EnricherDelta<MenuItem>;
    type Input = EnricherInput<MenuItem, TransactionItem>;
    type Output = EnrichedTransactionItem;

    fn session_data_type(&self) -> &'static str {
        "enricher::MenuEnricherState"
    }

    fn on_entity_upstream(&self, session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        match entity {
            EnricherInput::Reference(item) => Step::delta(EnricherDelta::Reference(item)),
            EnricherInput::Main(ti) => match session.items.get(&ti.item_id) {
                Some(item_name) => Step::row(EnrichedTransactionItem {
                    item_id: ti.item_id,
                    item_name: item_name.clone(),
                    quantity: ti.quantity,
                    subtotal: ti.subtotal,
                    created_at: ti.created_at,
                }),
                None => {
                    tracing::warn!(item_id = ti.item_id, "transaction item references unknown menu item, dropping");
                    Step::none()
                }
            },
        }
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let EnricherDelta::Reference(item) = delta;
        session.items.insert(item.item_id, item.item_name.clone());
    }

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }

    fn decode_main(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<TransactionItem>(bytes).map(EnricherInput::Main)
    }

    fn decode_reference(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<MenuItem>(bytes).map(EnricherInput::Reference)
    }
}

/// Reference-large: joins the full `User` stream against an aggregated
/// `StorePurchaseCounts` reference (spec §4.F: "main stream = all users;
/// reference stream = aggregated UserPurchasesByStore"). Only users that
/// appear in `required_users` — i.e. made at least one qualifying purchase
/// at some store — are worth emitting; everyone else is dropped here so
/// the merger never sees users with zero purchases.
pub struct UserPurchaseEnricher;

impl Operator for UserPurchaseEnricher {
    type Session = StorePurchaseCounts;
    type Delta = EnricherDelta<StorePurchaseCounts>;
    type Input = EnricherInput<StorePurchaseCounts, User>;
    type Output = UserPurchasesByStore;

    fn session_data_type(&self) -> &'static str {
        "enricher::StorePurchaseCounts"
    }

    fn on_entity_upstream(&self, session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        match entity {
            EnricherInput::Reference(counts) => Step::delta(EnricherDelta::Reference(counts)),
            EnricherInput::Main(user) => {
                let mut stores = HashMap::new();
                for (store_id, users) in &session.stores {
                    if let Some(purchases) = users.get(&user.user_id) {
                        stores.insert(
                            *store_id,
                            HashMap::from([(
                                user.user_id,
                                UserPurchaseStats {
                                    purchases: *purchases,
                                    birthday: user.birthdate,
                                    store_name: String::new(),
                                },
                            )]),
                        );
                    }
                }

                if stores.is_empty() {
                    Step::none()
                } else {
                    Step::row(UserPurchasesByStore { stores })
                }
            }
        }
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let EnricherDelta::Reference(counts) = delta;
        for (store_id, users) in &counts.stores {
            let dst = session.stores.entry(*store_id).or_default();
            for (user_id, count) in users {
                *dst.entry(*user_id).or_insert(0) += count;
            }
        }
    }

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }

    fn decode_main(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<User>(bytes).map(EnricherInput::Main)
    }

    fn decode_reference(&self, bytes: &[u8]) -> Result<Self::Input, serde_json::Error> {
        serde_json::from_slice::<StorePurchaseCounts>(bytes).map(EnricherInput::Reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn transaction_enriched_once_store_is_known() {
        let op = StoreEnricher;
        let mut session = StoreEnricherState::default();
        let step = op.on_entity_upstream(
            &session,
            EnricherInput::Reference(Store {
                store_id: 7,
                store_name: "S7".into(),
            }),
        );
        op.apply_delta(&mut session, &step.delta.unwrap());

        let tx = Transaction {
            id: "t1".into(),
            store_id: 7,
            user_id: None,
            final_amount: 10.0,
            created_at: Utc::now(),
        };
        let step = op.on_entity_upstream(&session, EnricherInput::Main(tx));
        assert_eq!(step.rows[0].store_name, "S7");
    }

    #[test]
    fn user_without_purchases_is_dropped() {
        let op = UserPurchaseEnricher;
        let session = StorePurchaseCounts::default();
        let user = User {
            user_id: 1,
            birthdate: Utc::now(),
        };
        let step = op.on_entity_upstream(&session, EnricherInput::Main(user));
        assert!(step.rows.is_empty());
    }
}
