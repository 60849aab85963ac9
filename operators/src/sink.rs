use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wire::entities::{SemesterTpvByStore, Transaction, TransactionItemByPeriod, UserPurchasesByStore};

use crate::{Operator, Step};

/// Q1: collects every filtered transaction for the session and emits them
/// as a flat array (spec §6 result shape); no sort order is specified, so
/// rows are kept in arrival order.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct Q1Rows(pub Vec<(String, f64)>);

pub struct Q1Sink;

impl Operator for Q1Sink {
    type Session = Q1Rows;
    type Delta = (String, f64);
    type Input = Transaction;
    type Output = Value;

    fn session_data_type(&self) -> &'static str {
        "sink::Q1Rows"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta((entity.id, entity.final_amount))
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        session.0.push(delta.clone());
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        let rows: Vec<Value> = session
            .0
            .iter()
            .map(|(id, amount)| json!({ "transaction_id": id, "final_amount": amount }))
            .collect();
        vec![Value::Array(rows)]
    }
}

/// Q2/Q3/Q4 sinks receive exactly one merged accumulator message per
/// session (the mergers already collapsed every replica's partial into
/// one partition total) and format it at `end_of_session`.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct Slot<T>(pub Option<T>);

pub struct Q2Sink;

impl Operator for Q2Sink {
    type Session = Slot<TransactionItemByPeriod>;
    type Delta = TransactionItemByPeriod;
    type Input = TransactionItemByPeriod;
    type Output = Value;

    fn session_data_type(&self) -> &'static str {
        "sink::Q2"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(entity)
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        session.0 = Some(delta.clone());
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        let Some(by_period) = &session.0 else { return Vec::new() };
        vec![format_q2(by_period)]
    }
}

pub fn format_q2(by_period: &TransactionItemByPeriod) -> Value {
    let mut periods: Vec<&String> = by_period.periods.keys().collect();
    periods.sort();

    let results: Vec<Value> = periods
        .into_iter()
        .map(|period| {
            let items = &by_period.periods[period];
            // Tie on quantity/revenue is broken by lowest item_id (spec §6).
            let most_sold = items
                .iter()
                .max_by(|(id_a, a), (id_b, b)| a.quantity.cmp(&b.quantity).then(id_b.cmp(id_a)))
                .map(|(id, s)| json!({ "item_id": id, "item_name": s.item_name, "quantity": s.quantity }));
            let highest_revenue = items
                .iter()
                .max_by(|(id_a, a), (id_b, b)| a.amount.partial_cmp(&b.amount).unwrap().then(id_b.cmp(id_a)))
                .map(|(id, s)| json!({ "item_id": id, "item_name": s.item_name, "revenue": s.amount }));

            json!({
                "period": period,
                "most_sold_product": most_sold,
                "highest_revenue_product": highest_revenue,
            })
        })
        .collect();

    json!({
        "query": "Q2",
        "description": "Most sold and highest revenue product per month",
        "results": results,
    })
}

pub struct Q3Sink;

impl Operator for Q3Sink {
    type Session = Slot<SemesterTpvByStore>;
    type Delta = SemesterTpvByStore;
    type Input = SemesterTpvByStore;
    type Output = Value;

    fn session_data_type(&self) -> &'static str {
        "sink::Q3"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(entity)
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        session.0 = Some(delta.clone());
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        let Some(by_semester) = &session.0 else { return Vec::new() };
        vec![format_q3(by_semester)]
    }
}

pub fn format_q3(by_semester: &SemesterTpvByStore) -> Value {
    let mut rows: Vec<(String, u32, String, f64)> = Vec::new();
    for (semester, stores) in &by_semester.semesters {
        for (store_id, stats) in stores {
            rows.push((semester.clone(), *store_id, stats.store_name.clone(), stats.amount));
        }
    }
    // Q3 sort is (semester asc, store_name asc) (spec §6).
    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.2.cmp(&b.2)));

    let results: Vec<Value> = rows
        .into_iter()
        .map(|(semester, store_id, store_name, tpv)| {
            json!({ "semester": semester, "store_id": store_id, "store_name": store_name, "tpv": tpv })
        })
        .collect();

    json!({
        "query": "Q3",
        "description": "Total purchase value per store per semester",
        "results": results,
    })
}

pub struct Q4Sink;

impl Operator for Q4Sink {
    type Session = Slot<UserPurchasesByStore>;
    type Delta = UserPurchasesByStore;
    type Input = UserPurchasesByStore;
    type Output = Value;

    fn session_data_type(&self) -> &'static str {
        "sink::Q4"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::delta(entity)
    }

    fn apply_delta(&self, session: &mut Self::Session, delta: &Self::Delta) {
        let dst = session.0.get_or_insert_with(UserPurchasesByStore::default);
        for (store_id, users) in &delta.stores {
            let bucket = dst.stores.entry(*store_id).or_default();
            for (user_id, stats) in users {
                bucket.insert(*user_id, stats.clone());
            }
        }
    }

    fn end_of_session(&self, session: &Self::Session) -> Vec<Self::Output> {
        let Some(by_store) = &session.0 else { return Vec::new() };
        vec![format_q4(by_store)]
    }
}

pub fn format_q4(by_store: &UserPurchasesByStore) -> Value {
    let mut rows: Vec<(String, chrono::DateTime<chrono::Utc>, u64)> = Vec::new();

    for users in by_store.stores.values() {
        let mut ranked: Vec<_> = users.values().collect();
        // (purchases desc, birthdate asc) then exactly the top 3 per store
        // (spec §6: ties tolerated upstream via top-35 candidates, final
        // cut is always three rows).
        ranked.sort_by(|a, b| b.purchases.cmp(&a.purchases).then(a.birthday.cmp(&b.birthday)));
        for stats in ranked.into_iter().take(3) {
            rows.push((stats.store_name.clone(), stats.birthday, stats.purchases));
        }
    }

    rows.sort_by(|a, b| a.0.cmp(&b.0).then(b.2.cmp(&a.2)).then(a.1.cmp(&b.1)));

    let results: Vec<Value> = rows
        .into_iter()
        .map(|(store_name, birthdate, purchases_qty)| {
            json!({ "store_name": store_name, "birthdate": birthdate, "purchases_qty": purchases_qty })
        })
        .collect();

    json!({
        "query": "Q4",
        "description": "Top 3 customers by purchase count per store",
        "results": results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use wire::entities::{ItemPeriodStats, StoreTpvStats, UserPurchaseStats};

    #[test]
    fn q2_formats_per_spec_example() {
        let mut periods = HashMap::new();
        let mut items = HashMap::new();
        items.insert(
            1,
            ItemPeriodStats {
                quantity: 3,
                amount: 30.0,
                item_name: "Latte".into(),
            },
        );
        items.insert(
            2,
            ItemPeriodStats {
                quantity: 1,
                amount: 100.0,
                item_name: "Espresso".into(),
            },
        );
        periods.insert("2024-01".to_string(), items);

        let formatted = format_q2(&TransactionItemByPeriod { periods });
        let results = formatted["results"].as_array().unwrap();
        assert_eq!(results[0]["period"], "2024-01");
        assert_eq!(results[0]["most_sold_product"]["item_name"], "Latte");
        assert_eq!(results[0]["highest_revenue_product"]["item_name"], "Espresso");
    }

    #[test]
    fn q3_sorted_semester_then_store_name() {
        let mut semesters = HashMap::new();
        let mut h1 = HashMap::new();
        h1.insert(
            7,
            StoreTpvStats {
                store_name: "S7".into(),
                amount: 100.0,
            },
        );
        let mut h2 = HashMap::new();
        h2.insert(
            7,
            StoreTpvStats {
                store_name: "S7".into(),
                amount: 250.0,
            },
        );
        semesters.insert("2024-H1".to_string(), h1);
        semesters.insert("2024-H2".to_string(), h2);

        let formatted = format_q3(&SemesterTpvByStore { semesters });
        let results = formatted["results"].as_array().unwrap();
        assert_eq!(results[0]["semester"], "2024-H1");
        assert_eq!(results[0]["tpv"], 100.0);
        assert_eq!(results[1]["semester"], "2024-H2");
        assert_eq!(results[1]["tpv"], 250.0);
    }

    #[test]
    fn q4_breaks_ties_by_birthdate_then_caps_at_three() {
        let mut store = HashMap::new();
        let mk = |purchases, year| UserPurchaseStats {
            purchases,
            birthday: Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            store_name: "Store1".into(),
        };
        store.insert(1, mk(5, 1990));
        store.insert(2, mk(3, 1985));
        store.insert(3, mk(3, 1995));
        store.insert(4, mk(4, 2000));

        let mut stores = HashMap::new();
        stores.insert(1, store);
        let formatted = format_q4(&UserPurchasesByStore { stores });
        let results = formatted["results"].as_array().unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["purchases_qty"], 5);
        assert_eq!(results[1]["purchases_qty"], 4);
        // B (1985) beats C (1995) on the birthdate-asc tiebreak.
        assert_eq!(results[2]["purchases_qty"], 3);
        assert_eq!(results[2]["birthdate"], "1985-01-01T00:00:00Z");
    }
}
