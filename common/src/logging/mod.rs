mod trace_id;

use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub use trace_id::TraceId;

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Initializes the global tracing subscriber. Safe to call multiple times
/// per process; only the first call takes effect.
pub fn init_tracing(service_name: &'static str, json: bool) {
    LOGGER_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let base = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .with_span_events(fmt::format::FmtSpan::CLOSE);

        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.pretty())
                .init();
        }

        tracing::info!(service = service_name, "logger initialized");
    });
}

/// Root span for one (stage, replica) worker loop iteration.
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id,
        stage_name = field::Empty,
        session_id = field::Empty,
    )
}

pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!(
        "child",
        name = %name,
        stage_name = field::Empty,
        session_id = field::Empty,
    )
}

pub fn annotate_span(stage_name: &str, session_id: Option<&uuid::Uuid>) {
    let span = Span::current();
    span.record("stage_name", field::display(stage_name));
    if let Some(sid) = session_id {
        span.record("session_id", field::display(sid));
    }
}

/// Runs `fut`, logging a warning if it takes longer than `max`.
pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
