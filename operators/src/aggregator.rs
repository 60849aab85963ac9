use serde::{Deserialize, Serialize};
use wire::entities::{
    EnrichedTransaction, EnrichedTransactionItem, ItemPeriodStats, SemesterTpvByStore, StoreTpvStats,
    StorePurchaseCounts, Transaction, TransactionItemByPeriod,
};

use crate::{Operator, Step};

/// Q2: folds enriched transaction items into a per-(period,item) running
/// total. `end_of_session` hands the whole accumulator to the merger
/// unchanged — the final top-item selection happens downstream, once all
/// replica partials are summed (spec §4.F Merger).
pub struct PeriodItemAggregator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodItemDelta {
    pub period: String,
    pub item_id: u32,
    pub item_name: String,
    pub qty_delta: u64,
    pub amount_delta: f64,
}

impl Operator for PeriodItemAggregator {
    type Session = TransactionItemByPeriod;
    type Delta = PeriodItemDelta;
    type Input = EnrichedTransactionItem;
    type Output = TransactionItemByPeriod;

    fn session_data_type(&self) -> &'static str {
        "aggregator::TransactionItemByPeriod"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(PeriodItemDelta {
            period: common::time::period_key(entity.created_at),
            item_id: entity.item_id,
            item_name: entity.item_name,
            qty_delta: entity.quantity as u64,
            amount_delta: entity.subtotal,
        })
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let items = session.periods.entry(delta.period.clone()).or_default();
        let stats = items.entry(delta.item_id).or_insert_with(|| ItemPeriodStats {
            quantity: 0,
            amount: 0.0,
            item_name: delta.item_name.clone(),
        });
        stats.quantity += delta.qty_delta;
        stats.amount += delta.amount_delta;
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}

/// Q3: folds enriched transactions into a per-(semester,store) TPV total.
pub struct SemesterStoreAggregator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemesterStoreDelta {
    pub semester: String,
    pub store_id: u32,
    pub store_name: String,
    pub amount_delta: f64,
}

impl Operator for SemesterStoreAggregator {
    type Session = SemesterTpvByStore;
    type Delta = SemesterStoreDelta;
    type Input = EnrichedTransaction;
    type Output = SemesterTpvByStore;

    fn session_data_type(&self) -> &'static str {
        "aggregator::SemesterTpvByStore"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(SemesterStoreDelta {
            semester: common::time::semester_key(entity.created_at),
            store_id: entity.store_id,
            store_name: entity.store_name,
            amount_delta: entity.final_amount,
        })
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let stores = session.semesters.entry(delta.semester.clone()).or_default();
        let stats = stores.entry(delta.store_id).or_insert_with(|| StoreTpvStats {
            store_name: delta.store_name.clone(),
            amount: 0.0,
        });
        stats.amount += delta.amount_delta;
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}

/// Q4 pre-pass: counts purchases per (store, user) straight off the raw
/// transaction stream, before the reference-large join attaches
/// birthdate/store_name (spec §4.F reference-large flow — this is the
/// "reference stream" the enricher later consumes).
pub struct UserPurchaseCountAggregator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PurchaseCountDelta {
    pub store_id: u32,
    pub user_id: u32,
}

impl Operator for UserPurchaseCountAggregator {
    type Session = StorePurchaseCounts;
    type Delta = PurchaseCountDelta;
    type Input = Transaction;
    type Output = StorePurchaseCounts;

    fn session_data_type(&self) -> &'static str {
        "aggregator::StorePurchaseCounts"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        match entity.user_id {
            Some(user_id) => Step::delta(PurchaseCountDelta {
                store_id: entity.store_id,
                user_id,
            }),
            None => Step::none(),
        }
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let users = session.stores.entry(delta.store_id).or_default();
        *users.entry(delta.user_id).or_insert(0) += 1;
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn period_item_matches_spec_example() {
        let op = PeriodItemAggregator;
        let mut session = TransactionItemByPeriod::default();

        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let latte = EnrichedTransactionItem {
            item_id: 1,
            item_name: "Latte".into(),
            quantity: 3,
            subtotal: 30.0,
            created_at,
        };
        let espresso = EnrichedTransactionItem {
            item_id: 2,
            item_name: "Espresso".into(),
            quantity: 1,
            subtotal: 100.0,
            created_at,
        };

        for entity in [latte, espresso] {
            let step = op.on_entity_upstream(&session, entity);
            op.apply_delta(&mut session, &step.delta.unwrap());
        }

        let period = &session.periods["2024-01"];
        assert_eq!(period[&1].quantity, 3);
        assert_eq!(period[&2].amount, 100.0);
    }

    #[test]
    fn semester_store_matches_spec_example() {
        let op = SemesterStoreAggregator;
        let mut session = SemesterTpvByStore::default();

        let h1 = EnrichedTransaction {
            id: "t1".into(),
            store_id: 7,
            store_name: "S7".into(),
            user_id: None,
            final_amount: 100.0,
            created_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        };
        let h2 = EnrichedTransaction {
            created_at: Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap(),
            final_amount: 250.0,
            ..h1.clone()
        };

        for tx in [h1, h2] {
            let step = op.on_entity_upstream(&session, tx);
            op.apply_delta(&mut session, &step.delta.unwrap());
        }

        assert_eq!(session.semesters["2024-H1"][&7].amount, 100.0);
        assert_eq!(session.semesters["2024-H2"][&7].amount, 250.0);
    }
}
