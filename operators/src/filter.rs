use chrono::{Datelike, Timelike};
use wire::entities::Transaction;

use crate::{Operator, Step};

/// Passes through entities matching a boolean predicate; keeps no
/// accumulator of its own (spec §4.F Filter). `Session` is `()` because a
/// filter's only state is the predicate, which is immutable configuration.
pub struct Filter<T, F> {
    predicate: F,
    _marker: std::marker::PhantomData<fn(&T) -> bool>,
}

impl<T, F> Filter<T, F>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Operator for Filter<T, F>
where
    T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    type Session = ();
    type Delta = ();
    type Input = T;
    type Output = T;

    fn session_data_type(&self) -> &'static str {
        "filter::()"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        if (self.predicate)(&entity) {
            Step::row(entity)
        } else {
            Step::none()
        }
    }

    fn apply_delta(&self, _session: &mut Self::Session, _delta: &Self::Delta) {}

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }
}

/// Q1: `final_amount >= 75` and the transaction's local hour falls in
/// `[6, 23]` (spec example: a transaction at 05:59 is rejected even with a
/// qualifying amount). The boundary on amount is inclusive — a $75.00
/// transaction passes.
pub fn q1_predicate(tx: &Transaction) -> bool {
    let hour = tx.created_at.hour();
    tx.final_amount >= 75.0 && (6..=23).contains(&hour) && matches!(tx.created_at.year(), 2024 | 2025)
}

pub type Q1Filter = Filter<Transaction, fn(&Transaction) -> bool>;

pub fn q1_filter() -> Q1Filter {
    Filter::new(q1_predicate as fn(&Transaction) -> bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tx(id: &str, amount: f64, hour: u32) -> Transaction {
        Transaction {
            id: id.to_string(),
            store_id: 1,
            user_id: None,
            final_amount: amount,
            created_at: Utc.with_ymd_and_hms(2024, 1, 10, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn matches_the_spec_example_exactly() {
        let op = q1_filter();
        let passing = op.on_entity_upstream(&(), tx("t1", 80.0, 12));
        assert_eq!(passing.rows.len(), 1);

        let amount_fails = op.on_entity_upstream(&(), tx("t2", 74.99, 12));
        assert!(amount_fails.rows.is_empty());

        let hour_fails = op.on_entity_upstream(&(), tx("t3", 75.0, 5));
        assert!(hour_fails.rows.is_empty());
    }

    #[test]
    fn boundary_amount_of_75_passes() {
        let op = q1_filter();
        let step = op.on_entity_upstream(&(), tx("t4", 75.0, 6));
        assert_eq!(step.rows.len(), 1);
    }
}
