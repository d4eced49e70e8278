#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use app_kernel::config::{DatabaseConfig, PolicyConfig, StreamConfig};
use app_kernel::connectors::Connectors;
use app_kernel::database::{DatabaseConnector, DatabasePool};
use app_kernel::logger::Logger;
use app_kernel::messaging::{BrokerConnection, BrokerConnector, PublishAck};
use app_kernel::policy::{MemoryPolicyStore, PolicyStore, PolicyStoreConnector};
use app_kernel::time::RecordingSleeper;
use app_kernel::{App, AppBuilder};
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Default)]
pub struct FakePool {
    pub closes: AtomicU32,
    pub fail_close: bool,
}

#[async_trait]
impl DatabasePool for FakePool {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.fail_close, "close failed");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out the same pool on every open and counts the opens.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    pub pool: Arc<FakePool>,
    pub opens: Arc<AtomicU32>,
    pub refuse: bool,
}

#[async_trait]
impl DatabaseConnector for FakeDatabase {
    async fn open(&self, _config: &DatabaseConfig) -> anyhow::Result<Arc<dyn DatabasePool>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.refuse, "connection refused");
        Ok(self.pool.clone())
    }
}

#[derive(Default)]
pub struct FakeConnection {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub streams: Mutex<Vec<String>>,
    pub closes: AtomicU32,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<PublishAck> {
        let mut published = self.published.lock();
        published.push((subject.to_string(), payload));
        Ok(PublishAck {
            stream: "EVENTS".into(),
            sequence: published.len() as u64,
        })
    }

    async fn ensure_stream(&self, stream: &StreamConfig) -> anyhow::Result<()> {
        self.streams.lock().push(stream.stream_name.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `failures` connects, then hands out one shared connection.
#[derive(Clone, Default)]
pub struct FakeBroker {
    pub connection: Arc<FakeConnection>,
    pub connects: Arc<AtomicU32>,
    pub failures: u32,
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, _url: &str) -> anyhow::Result<Arc<dyn BrokerConnection>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(attempt >= self.failures, "no servers available");
        Ok(self.connection.clone())
    }
}

#[derive(Clone, Default)]
pub struct FakePolicyStore {
    pub store: Arc<MemoryPolicyStore>,
}

#[async_trait]
impl PolicyStoreConnector for FakePolicyStore {
    async fn open(&self, _config: &PolicyConfig) -> anyhow::Result<Arc<dyn PolicyStore>> {
        Ok(self.store.clone())
    }
}

pub struct Fakes {
    pub database: FakeDatabase,
    pub broker: FakeBroker,
    pub policy: FakePolicyStore,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            database: FakeDatabase::default(),
            broker: FakeBroker::default(),
            policy: FakePolicyStore::default(),
            sleeper: Arc::new(RecordingSleeper::default()),
        }
    }
}

impl Fakes {
    pub fn connectors(&self) -> Connectors {
        let mut connectors = Connectors::default()
            .with_database(self.database.clone())
            .with_broker(self.broker.clone())
            .with_policy_store(self.policy.clone());
        connectors.sleeper = self.sleeper.clone();
        connectors
    }

    pub fn builder(&self, yaml: &str) -> AppBuilder {
        App::builder()
            .config_yaml(yaml)
            .logger(Logger::disabled())
            .connectors(self.connectors())
    }
}

pub const DATABASE: &str = r#"
app:
  name: orders
database:
  host: db.local
  port: 5432
  name: orders
  user: svc
  password: secret
"#;

pub const EVERYTHING: &str = r#"
app:
  name: orders
database:
  host: db.local
  port: 5432
  name: orders
  user: svc
messaging:
  pubsub_broker: nats://broker:4222
  retries: 2
  retry_delay_ms: 50
  streams:
    - stream_name: ORDERS
      subjects: ["orders.*"]
auth:
  policy:
    host: db.local
    port: 5432
    name: authz
    user: svc
"#;
