use tokio::io::{AsyncRead, AsyncWrite};

use broker::BrokerClient;
use wire::packet::{PacketType, RawPacket};

use crate::GatewayError;
use crate::config::GatewayConfig;

/// Consumes the results exchange and streams one `ResultPacket` per query
/// back to the client, awaiting a client `Ack` after each before moving on
/// to the next (spec §4.H: "streamed ResultPackets for each query ...
/// client Ack each"). Queries are served in the configured order, so a slow
/// sink for an earlier query delays later ones — acceptable since only one
/// client session is ever in flight.
pub struct ResultListener {
    client: BrokerClient,
    results_exchange: String,
    queries: Vec<String>,
}

impl ResultListener {
    pub fn new(client: BrokerClient, config: &GatewayConfig) -> Self {
        Self {
            client,
            results_exchange: config.results_exchange.clone(),
            queries: config.queries.clone(),
        }
    }

    fn query_queue(&self, query: &str) -> String {
        format!("{}_{query}", self.results_exchange)
    }

    async fn declare(&self) -> Result<(), GatewayError> {
        self.client.declare_direct_exchange(&self.results_exchange).await;
        for query in &self.queries {
            let queue = self.query_queue(query);
            self.client.declare_queue(&queue, 8).await;
            self.client.bind(&self.results_exchange, Some(query), &queue).await?;
        }
        Ok(())
    }

    pub async fn stream_results<S>(&self, stream: &mut S) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.declare().await?;

        for query in &self.queries {
            let queue = self.query_queue(query);
            let consumer = self.client.consumer_for(&queue).await?;
            let envelope = consumer
                .recv()
                .await
                .ok_or_else(|| GatewayError::ResultChannelClosed(query.clone()))?;
            consumer.ack(envelope.delivery_tag).await;

            tracing::info!(%query, "sending result to client");
            RawPacket::new(PacketType::Result, envelope.payload)
                .write_to(stream)
                .await?;

            let ack = RawPacket::read_from(stream).await?;
            if ack.packet_type != PacketType::Ack {
                return Err(GatewayError::UnexpectedPacket(ack.packet_type, PacketType::Ack));
            }

            self.client.delete_queue(&queue).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use broker::BrokerHub;
    use uuid::Uuid;

    use super::*;
    use crate::config::GatewayConfig;

    fn config(queries: &[&str]) -> GatewayConfig {
        GatewayConfig {
            port: 0,
            listen_backlog: 1,
            raw_routes: HashMap::new(),
            results_exchange: "results".into(),
            queries: queries.iter().map(|q| q.to_string()).collect(),
            heartbeat_interval_secs: 120,
        }
    }

    #[tokio::test]
    async fn streams_each_query_in_order_and_waits_for_its_ack() {
        let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(120));
        let listener = ResultListener::new(client.clone(), &config(&["q1", "q2"]));

        let (mut client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move { listener.stream_results(&mut server_side).await });

        // Results can arrive in either order; the listener must still emit
        // them in query-list order because it declares+consumes q1 first.
        listener_seed(&client, "results", "q2", b"\"q2 payload\"").await;
        listener_seed(&client, "results", "q1", b"\"q1 payload\"").await;

        let first = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(first.packet_type, PacketType::Result);
        assert_eq!(first.payload, b"\"q1 payload\"");
        RawPacket::new(PacketType::Ack, Vec::new()).write_to(&mut client_side).await.unwrap();

        let second = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(second.packet_type, PacketType::Result);
        assert_eq!(second.payload, b"\"q2 payload\"");
        RawPacket::new(PacketType::Ack, Vec::new()).write_to(&mut client_side).await.unwrap();

        server_task.await.unwrap().unwrap();
    }

    async fn listener_seed(client: &BrokerClient, exchange: &str, query: &str, payload: &[u8]) {
        client.declare_direct_exchange(exchange).await;
        let queue = format!("{exchange}_{query}");
        client.declare_queue(&queue, 8).await;
        client.bind(exchange, Some(query), &queue).await.unwrap();
        client
            .publish_to_queue(&queue, wire::headers::MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4()), payload.to_vec())
            .await
            .unwrap();
    }
}
