use std::sync::Arc;
use std::time::Duration;

use broker::{BrokerClient, BrokerHub};
use operators::Operator;
use operators::aggregator::{PeriodItemAggregator, SemesterStoreAggregator, UserPurchaseCountAggregator};
use operators::enricher::{MenuEnricher, StoreEnricher, UserPurchaseEnricher};
use operators::filter::q1_filter;
use operators::merger::{PeriodItemMerger, SemesterStoreMerger, UserPurchaseMerger};
use operators::router::TxRouterOperator;
use operators::sink::{Q1Sink, Q2Sink, Q3Sink, Q4Sink};
use operators::transformer::Transformer;
use runtime::{RuntimeError, Shutdown, StageWorker, WorkerConfig};
use wire::entities::{MenuItem, Store, Transaction, TransactionItem, User};

/// Builds and runs one stage replica to completion (spec §5: the process
/// lives for exactly one `StageWorker::run`, which itself blocks on the
/// shared shutdown signal before returning).
async fn run_stage<O: Operator>(
    operator: O,
    config: WorkerConfig,
    client: BrokerClient,
    shutdown: Shutdown,
) -> Result<(), RuntimeError> {
    let worker = StageWorker::new(config, operator, client, shutdown).await?;
    Arc::new(worker).run().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env()?;
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    common::init_tracing("worker", is_production);

    let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(config.heartbeat_interval_secs));
    let shutdown = Shutdown::new();

    tracing::info!(
        stage = %config.stage_name,
        module = %config.module_name,
        replica_id = config.replica_id,
        replica_count = config.replica_count,
        "starting worker"
    );

    let module_name = config.module_name.clone();
    match module_name.as_str() {
        "transformer_store" => run_stage(Transformer::<Store>::default(), config, client, shutdown).await?,
        "transformer_user" => run_stage(Transformer::<User>::default(), config, client, shutdown).await?,
        "transformer_menu_item" => run_stage(Transformer::<MenuItem>::default(), config, client, shutdown).await?,
        "transformer_transaction" => run_stage(Transformer::<Transaction>::default(), config, client, shutdown).await?,
        "transformer_transaction_item" => {
            run_stage(Transformer::<TransactionItem>::default(), config, client, shutdown).await?
        }
        "filter_q1" => run_stage(q1_filter(), config, client, shutdown).await?,
        "router_tx" => run_stage(TxRouterOperator, config, client, shutdown).await?,
        "aggregator_period_item" => run_stage(PeriodItemAggregator, config, client, shutdown).await?,
        "aggregator_semester_store" => run_stage(SemesterStoreAggregator, config, client, shutdown).await?,
        "aggregator_purchase_count" => run_stage(UserPurchaseCountAggregator, config, client, shutdown).await?,
        "merger_period_item" => run_stage(PeriodItemMerger, config, client, shutdown).await?,
        "merger_semester_store" => run_stage(SemesterStoreMerger, config, client, shutdown).await?,
        "merger_user_purchase" => run_stage(UserPurchaseMerger::default(), config, client, shutdown).await?,
        "enricher_store" => run_stage(StoreEnricher, config, client, shutdown).await?,
        "enricher_menu" => run_stage(MenuEnricher, config, client, shutdown).await?,
        "enricher_user_purchase" => run_stage(UserPurchaseEnricher, config, client, shutdown).await?,
        "sink_q1" => run_stage(Q1Sink, config, client, shutdown).await?,
        "sink_q2" => run_stage(Q2Sink, config, client, shutdown).await?,
        "sink_q3" => run_stage(Q3Sink, config, client, shutdown).await?,
        "sink_q4" => run_stage(Q4Sink, config, client, shutdown).await?,
        other => {
            tracing::error!(module = other, "unknown MODULE_NAME");
            return Err(format!("unknown MODULE_NAME: {other}").into());
        }
    }

    tracing::info!("worker exited cleanly");
    Ok(())
}
