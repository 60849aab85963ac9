use std::collections::HashMap;

use common::error::{ConfigError, env_or, require_env};
use wire::PacketType;

/// One entry of the `RAW_ROUTES` env var's JSON array (spec §6): where an
/// inbound batch of a given entity type gets published, and under what
/// routing convention (mirrors `runtime::config::OutputDescriptor`).
#[derive(Debug, Clone, serde::Deserialize)]
struct RawRouteDescriptor {
    packet: String,
    exchange: String,
    downstream_stage: String,
    downstream_workers: usize,
}

#[derive(Debug, Clone)]
pub struct RawRoute {
    pub exchange: String,
    pub downstream_stage: String,
    pub downstream_workers: usize,
}

fn parse_packet_type(s: &str) -> Result<PacketType, ConfigError> {
    Ok(match s {
        "store" => PacketType::StoreBatch,
        "users" => PacketType::UsersBatch,
        "transactions" => PacketType::TransactionsBatch,
        "transaction_items" => PacketType::TransactionItemsBatch,
        "menu_items" => PacketType::MenuItemsBatch,
        other => {
            return Err(ConfigError::InvalidVar {
                var: "RAW_ROUTES[].packet".into(),
                value: other.into(),
                reason: "expected one of store, users, transactions, transaction_items, menu_items".into(),
            });
        }
    })
}

/// Everything the gateway binary reads from its environment (spec §4.H).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Accepted for parity with the TCP framing interface; tokio's listener
    /// does not expose backlog tuning, so this is read but not applied.
    pub listen_backlog: u32,
    pub raw_routes: HashMap<PacketType, RawRoute>,
    pub results_exchange: String,
    pub queries: Vec<String>,
    pub heartbeat_interval_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_routes_json = require_env("RAW_ROUTES")?;
        let descriptors: Vec<RawRouteDescriptor> =
            serde_json::from_str(&raw_routes_json).map_err(|e| ConfigError::InvalidVar {
                var: "RAW_ROUTES".into(),
                value: raw_routes_json.clone(),
                reason: e.to_string(),
            })?;
        let mut raw_routes = HashMap::new();
        for d in descriptors {
            raw_routes.insert(
                parse_packet_type(&d.packet)?,
                RawRoute {
                    exchange: d.exchange,
                    downstream_stage: d.downstream_stage,
                    downstream_workers: d.downstream_workers,
                },
            );
        }

        let queries_csv = env_or("QUERIES", "q1,q2,q3,q4".to_string())?;
        let queries: Vec<String> = queries_csv.split(',').map(|s| s.trim().to_string()).collect();

        Ok(Self {
            port: env_or("PORT", 9000)?,
            listen_backlog: env_or("LISTEN_BACKLOG", 1)?,
            raw_routes,
            results_exchange: env_or("RESULTS_EXCHANGE", "results".to_string())?,
            queries,
            heartbeat_interval_secs: env_or("BROKER_HEARTBEAT_SECS", 120)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_packet_type_accepts_every_known_entity() {
        assert_eq!(parse_packet_type("store").unwrap(), PacketType::StoreBatch);
        assert_eq!(parse_packet_type("users").unwrap(), PacketType::UsersBatch);
        assert_eq!(parse_packet_type("transactions").unwrap(), PacketType::TransactionsBatch);
        assert_eq!(
            parse_packet_type("transaction_items").unwrap(),
            PacketType::TransactionItemsBatch
        );
        assert_eq!(parse_packet_type("menu_items").unwrap(), PacketType::MenuItemsBatch);
    }

    #[test]
    fn parse_packet_type_rejects_unknown_entity() {
        let err = parse_packet_type("coupons").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { .. }));
    }

    #[test]
    fn raw_route_descriptor_parses_from_json_array() {
        let json = r#"[
            {"packet": "store", "exchange": "raw_store", "downstream_stage": "transformer_store", "downstream_workers": 3}
        ]"#;
        let descriptors: Vec<RawRouteDescriptor> = serde_json::from_str(json).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].exchange, "raw_store");
        assert_eq!(descriptors[0].downstream_workers, 3);
    }
}
