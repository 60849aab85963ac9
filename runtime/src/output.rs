use std::collections::HashMap;

use broker::BrokerClient;
use operators::Operator;
use operators::router;
use tokio::sync::Mutex;
use uuid::Uuid;
use wire::codec::Batch;
use wire::headers::MessageHeaders;

use crate::RuntimeError;
use crate::config::{OutputSpec, RoutingFn};

/// Buffers an operator's output rows per downstream output, flushing a
/// packed batch with a fresh `MESSAGE_ID` once a partition reaches
/// `buffer_size` or the caller calls `flush_session` at batch/session
/// boundaries (spec §4.E Buffering).
///
/// Rows destined for a `tx_router` output are bucketed by their computed
/// partition key as they arrive, since that routing function's whole point
/// is pinning specific rows to specific downstream replicas regardless of
/// which upstream batch they came from; every other routing function picks
/// its destination once, at flush time, from the flushed batch's fresh
/// message id.
pub struct OutputFanout<O: Operator> {
    client: BrokerClient,
    outputs: Vec<OutputSpec>,
    buffer_size: usize,
    buffers: Mutex<HashMap<(String, String), Vec<O::Output>>>,
}

impl<O: Operator> OutputFanout<O> {
    pub fn new(client: BrokerClient, outputs: Vec<OutputSpec>, buffer_size: usize) -> Self {
        Self {
            client,
            outputs,
            buffer_size: buffer_size.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn declare(&self) {
        for out in &self.outputs {
            match out.routing_fn {
                RoutingFn::Broadcast => self.client.declare_fanout_exchange(&out.exchange).await,
                RoutingFn::Default | RoutingFn::ByStageName | RoutingFn::TxRouter => {
                    self.client.declare_direct_exchange(&out.exchange).await;
                    for k in 0..out.downstream_workers.max(1) {
                        let queue = format!("{}_{k}", out.downstream_stage);
                        self.client.declare_queue(&queue, 512).await;
                        let _ = self.client.bind(&out.exchange, Some(&queue), &queue).await;
                    }
                }
            }
        }
    }

    pub async fn push(&self, operator: &O, row: O::Output) -> Result<(), RuntimeError> {
        for out in &self.outputs {
            let partition_key = match out.routing_fn {
                RoutingFn::TxRouter => operator
                    .tx_route_key(&row)
                    .map(|(user_id, store_id)| {
                        router::tx_router(user_id, store_id, &out.downstream_stage, out.downstream_workers)
                    })
                    .unwrap_or_default(),
                _ => String::new(),
            };

            let should_flush = {
                let mut buffers = self.buffers.lock().await;
                let buf = buffers.entry((out.exchange.clone(), partition_key.clone())).or_default();
                buf.push(row.clone());
                buf.len() >= self.buffer_size
            };

            if should_flush {
                let rows = {
                    let mut buffers = self.buffers.lock().await;
                    buffers
                        .get_mut(&(out.exchange.clone(), partition_key.clone()))
                        .map(std::mem::take)
                        .unwrap_or_default()
                };
                if !rows.is_empty() {
                    self.flush_group(out, &partition_key, rows).await?;
                }
            }
        }
        Ok(())
    }

    /// Flushes every still-buffered partition (spec §4.E: "or one upstream
    /// batch, whichever comes first" — called once per processed batch).
    pub async fn flush_pending(&self) -> Result<(), RuntimeError> {
        let drained: Vec<((String, String), Vec<O::Output>)> = {
            let mut buffers = self.buffers.lock().await;
            buffers.drain().filter(|(_, rows)| !rows.is_empty()).collect()
        };
        for ((exchange, partition_key), rows) in drained {
            let out = self
                .outputs
                .iter()
                .find(|o| o.exchange == exchange)
                .expect("buffered exchange always has a matching output spec");
            self.flush_group(out, &partition_key, rows).await?;
        }
        Ok(())
    }

    async fn flush_group(&self, out: &OutputSpec, partition_key: &str, rows: Vec<O::Output>) -> Result<(), RuntimeError> {
        let message_id = Uuid::new_v4();
        let headers = MessageHeaders::new(Uuid::nil(), message_id);
        let payload = Batch::rows(rows).encode()?;

        match out.routing_fn {
            RoutingFn::Broadcast => {
                self.client.publish_to_exchange(&out.exchange, None, headers, payload).await?
            }
            RoutingFn::ByStageName => {
                let key = router::by_stage_name(&out.downstream_stage);
                self.client.publish_to_exchange(&out.exchange, Some(&key), headers, payload).await?
            }
            RoutingFn::Default => {
                let key = router::default_route(message_id, &out.downstream_stage, out.downstream_workers);
                self.client.publish_to_exchange(&out.exchange, Some(&key), headers, payload).await?
            }
            RoutingFn::TxRouter => {
                self.client.publish_to_exchange(&out.exchange, Some(partition_key), headers, payload).await?
            }
        }
        Ok(())
    }

    /// Spec §3 invariant 5 / §4.E: the leader emits exactly one logical EOF
    /// per output, but every downstream replica must independently learn
    /// the upstream is done so it can run its own intra-stage fan-in — so
    /// for partitioned outputs the EOF is replicated across every
    /// partition, while fanout/by-name outputs only ever had one
    /// destination to begin with.
    pub async fn send_eof(&self, session_id: Uuid) -> Result<(), RuntimeError> {
        for out in &self.outputs {
            let headers = MessageHeaders::new(session_id, Uuid::new_v4());
            let payload = Batch::<()>::eof().encode()?;
            match out.routing_fn {
                RoutingFn::Broadcast => {
                    self.client.publish_to_exchange(&out.exchange, None, headers, payload).await?
                }
                RoutingFn::ByStageName => {
                    let key = router::by_stage_name(&out.downstream_stage);
                    self.client.publish_to_exchange(&out.exchange, Some(&key), headers, payload).await?
                }
                RoutingFn::Default | RoutingFn::TxRouter => {
                    for k in 0..out.downstream_workers.max(1) {
                        let key = format!("{}_{k}", out.downstream_stage);
                        let headers = MessageHeaders::new(session_id, Uuid::new_v4());
                        let payload = Batch::<()>::eof().encode()?;
                        self.client.publish_to_exchange(&out.exchange, Some(&key), headers, payload).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
