use std::path::PathBuf;

use common::error::{ConfigError, env_or, require_env};

/// Routing function attached to one output declaration (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFn {
    /// `message_id mod downstream_workers` → `"<stage>_<k>"`.
    Default,
    /// Stage name verbatim — sinks publishing to the results exchange.
    ByStageName,
    /// SHA-256 of `(user_id, store_id)` — pins a shard to one replica.
    TxRouter,
    /// Always `"common"` — reference-data fanout to every replica.
    Broadcast,
}

impl RoutingFn {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "default" => Ok(Self::Default),
            "by_stage_name" => Ok(Self::ByStageName),
            "tx_router" => Ok(Self::TxRouter),
            "broadcast" => Ok(Self::Broadcast),
            other => Err(ConfigError::InvalidVar {
                var: "TO[].routing_fn".into(),
                value: other.into(),
                reason: "expected one of default, by_stage_name, tx_router, broadcast".into(),
            }),
        }
    }
}

/// One entry of the `TO` env var's JSON array (spec §6).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OutputDescriptor {
    pub name: String,
    pub downstream_stage: String,
    pub downstream_workers: usize,
    pub routing_fn: String,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub exchange: String,
    pub downstream_stage: String,
    pub downstream_workers: usize,
    pub routing_fn: RoutingFn,
}

/// Everything a stage worker binary reads from its environment (spec §6).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stage_name: String,
    pub module_name: String,
    pub replica_id: usize,
    pub replica_count: usize,
    pub from_exchange: String,
    pub outputs: Vec<OutputSpec>,
    pub enricher_exchange: Option<String>,
    pub wal_dir: PathBuf,
    pub snapshot_threshold: usize,
    pub buffer_size: usize,
    pub broker_prefetch: usize,
    pub heartbeat_interval_secs: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let stage_name = require_env("STAGE_NAME")?;
        let module_name = require_env("MODULE_NAME")?;
        let replica_id: usize = env_or("REPLICA_ID", 0)?;
        let replica_count: usize = env_or("REPLICAS", 1)?;
        let from_exchange = require_env("FROM")?;

        let to_json = require_env("TO")?;
        let descriptors: Vec<OutputDescriptor> =
            serde_json::from_str(&to_json).map_err(|e| ConfigError::InvalidVar {
                var: "TO".into(),
                value: to_json.clone(),
                reason: e.to_string(),
            })?;
        let outputs = descriptors
            .into_iter()
            .map(|d| {
                Ok(OutputSpec {
                    exchange: d.name,
                    downstream_stage: d.downstream_stage,
                    downstream_workers: d.downstream_workers,
                    routing_fn: RoutingFn::parse(&d.routing_fn)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let enricher_exchange = std::env::var("ENRICHER").ok();

        Ok(Self {
            stage_name: stage_name.clone(),
            module_name,
            replica_id,
            replica_count,
            from_exchange,
            outputs,
            enricher_exchange,
            wal_dir: PathBuf::from(env_or("WAL_DIR", format!("/var/lib/engine/{stage_name}"))?),
            snapshot_threshold: env_or("SNAPSHOT_THRESHOLD", 100)?,
            buffer_size: env_or("BUFFER_SIZE", 10_000)?,
            broker_prefetch: env_or("BROKER_PREFETCH", 500)?,
            heartbeat_interval_secs: env_or("BROKER_HEARTBEAT_SECS", 120)?,
        })
    }

    /// This replica's own queue/routing-key identity: `"<stage>_<index>"`.
    pub fn own_routing_key(&self) -> String {
        format!("{}_{}", self.stage_name, self.replica_id)
    }

    /// The stage-private fanout exchange replicas use to exchange
    /// `WorkerEof` markers (spec §4.E).
    pub fn intra_stage_exchange(&self) -> String {
        format!("intra_{}", self.stage_name)
    }

    pub fn is_leader(&self) -> bool {
        self.replica_id == 0
    }
}
