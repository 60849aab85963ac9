use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use broker::BrokerClient;
use operators::router;
use wire::codec::Batch;
use wire::headers::MessageHeaders;
use wire::packet::{ErrorPacket, PacketType, RawPacket};

use crate::GatewayError;
use crate::config::GatewayConfig;
use crate::results::ResultListener;
use crate::session::GatewaySession;

/// Drives one client's full `FileSendStart -> data batches -> FileSendEnd ->
/// results` protocol exchange (spec §4.H). The gateway only ever has one of
/// these running at a time.
pub struct ClientHandler {
    client: BrokerClient,
    config: GatewayConfig,
}

impl ClientHandler {
    pub fn new(client: BrokerClient, config: GatewayConfig) -> Self {
        Self { client, config }
    }

    pub async fn handle_session<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) {
        if let Err(e) = self.run_session(stream).await {
            tracing::error!(error = %e, "client session failed");
            let packet = ErrorPacket {
                code: 500,
                message: e.to_string(),
            }
            .to_raw();
            let _ = packet.write_to(stream).await;
        }
    }

    async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<(), GatewayError> {
        let start = RawPacket::read_from(stream).await?;
        if start.packet_type != PacketType::FileSendStart {
            return Err(GatewayError::UnexpectedPacket(start.packet_type, PacketType::FileSendStart));
        }
        self.ack(stream).await?;

        let session_id = Uuid::new_v4();
        RawPacket::new(PacketType::SessionId, session_id.simple().to_string().into_bytes())
            .write_to(stream)
            .await?;

        let mut session = GatewaySession::new(session_id);
        tracing::info!(%session_id, "session started");

        loop {
            let packet = RawPacket::read_from(stream).await?;
            match packet.packet_type {
                PacketType::FileSendEnd => {
                    self.ack(stream).await?;
                    break;
                }
                pt if self.config.raw_routes.contains_key(&pt) => {
                    self.forward_batch(session_id, &mut session, pt, packet.payload).await?;
                }
                other => {
                    return Err(GatewayError::UnexpectedPacket(other, PacketType::FileSendEnd));
                }
            }
        }

        tracing::info!(%session_id, "data transfer complete, streaming results");
        let listener = ResultListener::new(self.client.clone(), &self.config);
        listener.stream_results(stream).await?;
        Ok(())
    }

    async fn ack<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<(), GatewayError> {
        RawPacket::new(PacketType::Ack, Vec::new()).write_to(stream).await?;
        Ok(())
    }

    /// Forwards one inbound batch's bytes verbatim to its raw exchange. A
    /// non-EOF batch is routed to a single partition the same way
    /// `OutputFanout` would (`default_route` off a fresh `MESSAGE_ID`); an
    /// EOF batch is replicated across every downstream partition so each
    /// replica of the first stage independently learns the upload is done.
    async fn forward_batch(
        &self,
        session_id: Uuid,
        session: &mut GatewaySession,
        packet_type: PacketType,
        payload: Vec<u8>,
    ) -> Result<(), GatewayError> {
        let route = self
            .config
            .raw_routes
            .get(&packet_type)
            .expect("caller already checked raw_routes contains packet_type");

        let batch: Batch<serde_json::Value> = Batch::decode(&payload)?;
        session.record_batch(packet_type, batch.eof);

        if batch.eof {
            tracing::debug!(
                %session_id,
                ?packet_type,
                batches = session.batches_sent(packet_type),
                eof_received = session.eof_received(packet_type),
                "entity upload complete"
            );
            for k in 0..route.downstream_workers.max(1) {
                let key = format!("{}_{k}", route.downstream_stage);
                let headers = MessageHeaders::new(session_id, Uuid::new_v4());
                self.client
                    .publish_to_exchange(&route.exchange, Some(&key), headers, payload.clone())
                    .await?;
            }
        } else {
            let message_id = Uuid::new_v4();
            let key = router::default_route(message_id, &route.downstream_stage, route.downstream_workers);
            let headers = MessageHeaders::new(session_id, message_id);
            self.client
                .publish_to_exchange(&route.exchange, Some(&key), headers, payload)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use broker::BrokerHub;

    use super::*;
    use crate::config::RawRoute;

    fn test_config() -> GatewayConfig {
        let mut raw_routes = HashMap::new();
        raw_routes.insert(
            PacketType::StoreBatch,
            RawRoute {
                exchange: "raw_store".into(),
                downstream_stage: "transformer_store".into(),
                downstream_workers: 2,
            },
        );
        GatewayConfig {
            port: 0,
            listen_backlog: 1,
            raw_routes,
            results_exchange: "results".into(),
            queries: vec!["q1".into()],
            heartbeat_interval_secs: 120,
        }
    }

    #[tokio::test]
    async fn full_session_forwards_batches_and_streams_one_result_per_query() {
        let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(120));
        let config = test_config();

        // What the server would normally declare up front.
        client.declare_direct_exchange("raw_store").await;
        for k in 0..2 {
            let queue = format!("transformer_store_{k}");
            client.declare_queue(&queue, 8).await;
            client.bind("raw_store", Some(&queue), &queue).await.unwrap();
        }
        client.declare_direct_exchange("results").await;
        client.declare_queue("results_q1", 8).await;
        client.bind("results", Some("q1"), "results_q1").await.unwrap();

        // Pre-seed the query's result so the listener doesn't block forever.
        client
            .publish_to_queue(
                "results_q1",
                wire::headers::MessageHeaders::new(Uuid::new_v4(), Uuid::new_v4()),
                br#"{"results": []}"#.to_vec(),
            )
            .await
            .unwrap();

        let handler = ClientHandler::new(client.clone(), config);

        let (mut client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            handler.handle_session(&mut server_side).await;
        });

        RawPacket::new(PacketType::FileSendStart, Vec::new())
            .write_to(&mut client_side)
            .await
            .unwrap();
        let ack = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(ack.packet_type, PacketType::Ack);

        let session_id_packet = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(session_id_packet.packet_type, PacketType::SessionId);

        let rows_batch = Batch::rows(vec![serde_json::json!({"store_id": 1, "store_name": "Downtown"})])
            .encode()
            .unwrap();
        RawPacket::new(PacketType::StoreBatch, rows_batch)
            .write_to(&mut client_side)
            .await
            .unwrap();

        let eof_batch = Batch::<serde_json::Value>::eof().encode().unwrap();
        RawPacket::new(PacketType::StoreBatch, eof_batch)
            .write_to(&mut client_side)
            .await
            .unwrap();

        RawPacket::new(PacketType::FileSendEnd, Vec::new())
            .write_to(&mut client_side)
            .await
            .unwrap();
        let ack = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(ack.packet_type, PacketType::Ack);

        let result_packet = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(result_packet.packet_type, PacketType::Result);
        assert_eq!(result_packet.payload, br#"{"results": []}"#);

        RawPacket::new(PacketType::Ack, Vec::new())
            .write_to(&mut client_side)
            .await
            .unwrap();

        server_task.await.unwrap();

        // The non-EOF batch landed on exactly one partition; the EOF batch
        // was replicated to both.
        let c0 = client.consumer_for("transformer_store_0").await.unwrap();
        let c1 = client.consumer_for("transformer_store_1").await.unwrap();
        let mut total_rows_messages = 0;
        let mut eof_count = 0;
        for consumer in [&c0, &c1] {
            while let Ok(Some(envelope)) =
                tokio::time::timeout(Duration::from_millis(50), consumer.recv()).await
            {
                let batch: Batch<serde_json::Value> = Batch::decode(&envelope.payload).unwrap();
                if batch.eof {
                    eof_count += 1;
                } else {
                    total_rows_messages += 1;
                }
            }
        }
        assert_eq!(total_rows_messages, 1);
        assert_eq!(eof_count, 2);
    }

    #[tokio::test]
    async fn unexpected_first_packet_sends_error_and_closes() {
        let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(120));
        let handler = ClientHandler::new(client, test_config());

        let (mut client_side, mut server_side) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            handler.handle_session(&mut server_side).await;
        });

        RawPacket::new(PacketType::FileSendEnd, Vec::new())
            .write_to(&mut client_side)
            .await
            .unwrap();

        let response = RawPacket::read_from(&mut client_side).await.unwrap();
        assert_eq!(response.packet_type, PacketType::Error);

        server_task.await.unwrap();
    }
}
