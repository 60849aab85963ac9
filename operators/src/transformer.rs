use crate::{Operator, Step};

/// The entry-stage operator for each of the five raw streams (spec §4.F
/// Transformer). The wire codec (`wire::codec::Batch`) already decodes
/// JSON rows straight into typed entities, so there is no separate
/// "parse a raw row" step left to do here — the transformer's job is
/// purely to sit at the front of a stage so the buffering/batching and
/// EOF fan-in machinery in `runtime` has a uniform first hop before any
/// filter, router, or aggregator runs.
pub struct Transformer<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Default for Transformer<T> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static> Operator for Transformer<T> {
    type Session = ();
    type Delta = ();
    type Input = T;
    type Output = T;

    fn session_data_type(&self) -> &'static str {
        "transformer::()"
    }

    fn on_entity_upstream(&self, _session: &Self::Session, entity: Self::Input) -> Step<Self::Delta, Self::Output> {
        Step::row(entity)
    }

    fn apply_delta(&self, _session: &mut Self::Session, _delta: &Self::Delta) {}

    fn end_of_session(&self, _session: &Self::Session) -> Vec<Self::Output> {
        Vec::new()
    }
}
