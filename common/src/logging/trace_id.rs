use uuid::Uuid;

/// Correlation id that follows a session through every stage it touches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn new(v: Uuid) -> Self {
        Self(v)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<Uuid> for TraceId {
    fn from(v: Uuid) -> Self {
        Self(v)
    }
}
