//! NATS JetStream broker client.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{StorageKind, StreamConfig};
use crate::messaging::{BrokerConnection, BrokerConnector, PublishAck};

#[derive(Debug, Default, Clone, Copy)]
pub struct NatsConnector;

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Arc<dyn BrokerConnection>> {
        let client = async_nats::connect(url).await?;
        let context = jetstream::new(client.clone());
        tracing::info!(url, "connected to broker");
        Ok(Arc::new(NatsConnection {
            inner: RwLock::new(Some(Open { client, context })),
        }))
    }
}

struct Open {
    client: async_nats::Client,
    context: jetstream::Context,
}

/// A JetStream connection. Dropping the last client handle disconnects,
/// so `close` flushes and then drops both handles.
pub struct NatsConnection {
    inner: RwLock<Option<Open>>,
}

fn stream_config(stream: &StreamConfig) -> stream::Config {
    stream::Config {
        name: stream.stream_name.clone(),
        subjects: stream.subjects.clone(),
        max_age: Duration::from_secs(stream.max_age),
        storage: match stream.storage_type {
            StorageKind::File => stream::StorageType::File,
            StorageKind::Memory => stream::StorageType::Memory,
        },
        num_replicas: stream.replicas,
        ..Default::default()
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<PublishAck> {
        let inner = self.inner.read().await;
        let open = inner
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("broker connection is closed"))?;
        let ack = open
            .context
            .publish(subject.to_string(), payload.into())
            .await?
            .await?;
        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn ensure_stream(&self, stream: &StreamConfig) -> anyhow::Result<()> {
        let inner = self.inner.read().await;
        let open = inner
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("broker connection is closed"))?;
        open.context
            .get_or_create_stream(stream_config(stream))
            .await?;
        tracing::debug!(stream = %stream.stream_name, "stream ready");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(open) = self.inner.write().await.take() else {
            return Ok(());
        };
        open.client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_settings_are_translated() {
        let config = stream_config(&StreamConfig {
            stream_name: "ORDERS".into(),
            subjects: vec!["orders.*".into()],
            max_age: 60,
            storage_type: StorageKind::Memory,
            replicas: 3,
        });
        assert_eq!("ORDERS", config.name);
        assert_eq!(vec!["orders.*".to_string()], config.subjects);
        assert_eq!(Duration::from_secs(60), config.max_age);
        assert_eq!(stream::StorageType::Memory, config.storage);
        assert_eq!(3, config.num_replicas);
    }
}
