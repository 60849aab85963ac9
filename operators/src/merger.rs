use serde::{Deserialize, Serialize};
use wire::entities::{SemesterTpvByStore, TransactionItemByPeriod, UserPurchasesByStore};

use crate::{Operator, Step};

/// Sums period/item aggregates across upstream replicas into one partition
/// total (spec §4.F Merger). Each upstream replica's `end_of_session`
/// output arrives here as a single `Input` row; there is no per-entity
/// delta finer than "merge this whole partial in".
pub struct PeriodItemMerger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeDelta<T>(pub T);

impl Operator for PeriodItemMerger {
    type Session = TransactionItemByPeriod;
    type Delta = MergeDelta<TransactionItemByPeriod>;
    type Input = TransactionItemByPeriod;
    type Output = TransactionItemByPeriod;

    fn session_data_type(&self) -> &'static str {
        "merger::TransactionItemByPeriod"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(MergeDelta(entity))
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        for (period, items) in &delta.0.periods {
            let dst = session.periods.entry(period.clone()).or_default();
            for (item_id, stats) in items {
                let entry = dst.entry(*item_id).or_insert_with(|| stats.clone());
                entry.quantity += stats.quantity;
                entry.amount += stats.amount;
                entry.item_name = stats.item_name.clone();
            }
        }
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}

/// Sums semester/store TPV partials across upstream replicas (spec §4.F).
pub struct SemesterStoreMerger;

impl Operator for SemesterStoreMerger {
    type Session = SemesterTpvByStore;
    type Delta = MergeDelta<SemesterTpvByStore>;
    type Input = SemesterTpvByStore;
    type Output = SemesterTpvByStore;

    fn session_data_type(&self) -> &'static str {
        "merger::SemesterTpvByStore"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(MergeDelta(entity))
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        for (semester, stores) in &delta.0.semesters {
            let dst = session.semesters.entry(semester.clone()).or_default();
            for (store_id, stats) in stores {
                let entry = dst.entry(*store_id).or_insert_with(|| stats.clone());
                entry.amount += stats.amount;
                entry.store_name = stats.store_name.clone();
            }
        }
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}

/// Merges per-store user-purchase partials, keeping the top-35 candidates
/// per store so the final top-3 selection (spec §6 Q4 result shape) has
/// headroom for ties without carrying every user forever. Deterministic
/// tie-break by `user_id` ascending matches the spec's merge requirement;
/// the caller applies the final `(purchases desc, birthdate asc)` ordering
/// when formatting results.
pub struct UserPurchaseMerger {
    candidate_cap: usize,
}

impl Default for UserPurchaseMerger {
    fn default() -> Self {
        Self { candidate_cap: 35 }
    }
}

impl Operator for UserPurchaseMerger {
    type Session = UserPurchasesByStore;
    type Delta = MergeDelta<UserPurchasesByStore>;
    type Input = UserPurchasesByStore;
    type Output = UserPurchasesByStore;

    fn session_data_type(&self) -> &'static str {
        "merger::UserPurchasesByStore"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(MergeDelta(entity))
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        for (store_id, users) in &delta.0.stores {
            let dst = session.stores.entry(*store_id).or_default();
            for (user_id, stats) in users {
                let entry = dst.entry(*user_id).or_insert_with(|| stats.clone());
                entry.purchases += stats.purchases;
                entry.birthday = stats.birthday;
                entry.store_name = stats.store_name.clone();
            }

            if dst.len() > self.candidate_cap {
                let mut ranked: Vec<(u32, u64)> = dst.iter().map(|(id, s)| (*id, s.purchases)).collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                let keep: std::collections::HashSet<u32> =
                    ranked.into_iter().take(self.candidate_cap).map(|(id, _)| id).collect();
                dst.retain(|id, _| keep.contains(id));
            }
        }
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        vec![session.clone()]
    }
}
