//! Message-broker publishing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::StreamConfig;
use crate::error::{display_error, Error, Result};
use crate::time::Sleeper;

/// Broker acknowledgement of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<PublishAck>;

    /// Creates the stream unless it already exists.
    async fn ensure_stream(&self, stream: &StreamConfig) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Arc<dyn BrokerConnection>>;
}

/// Connector used when the crate is built without a broker client.
pub struct NoBrokerClient;

#[async_trait]
impl BrokerConnector for NoBrokerClient {
    async fn connect(&self, _url: &str) -> anyhow::Result<Arc<dyn BrokerConnection>> {
        anyhow::bail!("built without the `nats` feature, no broker client available")
    }
}

/// How often and how patiently a broker operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Runs `attempt` until it succeeds or `retries + 1` attempts failed.
    /// On failure returns the last error with the number of attempts made.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        what: &str,
        mut attempt: F,
    ) -> std::result::Result<T, (anyhow::Error, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if attempts <= self.retries => {
                    tracing::warn!(
                        attempt = attempts,
                        of = self.retries + 1,
                        error = %display_error(&e),
                        "{what} failed, retrying"
                    );
                    sleeper.sleep(self.delay).await;
                }
                Err(e) => return Err((e, attempts)),
            }
        }
    }
}

/// Publishes to the broker, retrying failed publishes.
pub struct Publisher {
    connection: Arc<dyn BrokerConnection>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            connection,
            retry,
            sleeper,
            closed: AtomicBool::new(false),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Result<PublishAck> {
        let payload = payload.into();
        let result = self
            .retry
            .run(self.sleeper.as_ref(), "publish", || {
                self.connection.publish(subject, payload.clone())
            })
            .await;
        match result {
            Ok(ack) => {
                tracing::debug!(subject, stream = %ack.stream, sequence = ack.sequence, "published");
                Ok(ack)
            }
            Err((source, attempts)) => Err(Error::PublishFailed {
                subject: subject.to_string(),
                attempts,
                source: source.into(),
            }),
        }
    }

    /// Serializes `message` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        message: &T,
    ) -> Result<PublishAck> {
        let payload = serde_json::to_vec(message).map_err(|e| Error::PublishFailed {
            subject: subject.to_string(),
            attempts: 0,
            source: e.into(),
        })?;
        self.publish(subject, payload).await
    }

    /// Closes the connection the first time it is called; later calls do
    /// nothing.
    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connection.close().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::time::RecordingSleeper;

    /// Fails the first `failures` publishes, then acknowledges.
    #[derive(Default)]
    pub(crate) struct FlakyConnection {
        pub failures: Mutex<u32>,
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
        pub closes: Mutex<u32>,
    }

    #[async_trait]
    impl BrokerConnection for FlakyConnection {
        async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<PublishAck> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    anyhow::bail!("no responders");
                }
            }
            let mut published = self.published.lock();
            published.push((subject.to_string(), payload));
            Ok(PublishAck {
                stream: "ORDERS".into(),
                sequence: published.len() as u64,
            })
        }

        async fn ensure_stream(&self, _stream: &StreamConfig) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    fn publisher(failures: u32, retries: u32) -> (Publisher, Arc<FlakyConnection>, Arc<RecordingSleeper>) {
        let connection = Arc::new(FlakyConnection {
            failures: Mutex::new(failures),
            ..Default::default()
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let publisher = Publisher::new(
            connection.clone(),
            RetryPolicy::new(retries, Duration::from_millis(100)),
            sleeper.clone(),
        );
        (publisher, connection, sleeper)
    }

    #[tokio::test]
    async fn publish_returns_the_ack() {
        let (publisher, connection, sleeper) = publisher(0, 0);
        let ack = publisher.publish("orders.created", b"{}".to_vec()).await.unwrap();
        assert_eq!(PublishAck { stream: "ORDERS".into(), sequence: 1 }, ack);
        assert_eq!(1, connection.published.lock().len());
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn publish_retries_with_delay() {
        let (publisher, connection, sleeper) = publisher(2, 3);
        publisher.publish("orders.created", "x").await.unwrap();
        assert_eq!(vec![Duration::from_millis(100); 2], sleeper.slept());
        assert_eq!(1, connection.published.lock().len());
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let (publisher, _, _) = publisher(5, 2);
        match publisher.publish("orders.created", "x").await {
            Err(Error::PublishFailed { subject, attempts, .. }) => {
                assert_eq!("orders.created", subject);
                assert_eq!(3, attempts);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_payloads_are_serialized() {
        #[derive(Serialize)]
        struct Created {
            id: u32,
        }
        let (publisher, connection, _) = publisher(0, 0);
        publisher.publish_json("orders.created", &Created { id: 7 }).await.unwrap();
        assert_eq!(br#"{"id":7}"#.to_vec(), connection.published.lock()[0].1);
    }

    #[tokio::test]
    async fn close_happens_once() {
        let (publisher, connection, _) = publisher(0, 0);
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert_eq!(1, *connection.closes.lock());
    }
}
