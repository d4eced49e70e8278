use std::sync::Arc;

use crate::database::DatabaseConnector;
use crate::messaging::BrokerConnector;
use crate::policy::PolicyStoreConnector;
use crate::time::{Sleeper, TokioSleeper};

/// Factories the built-in options use to open external resources.
///
/// The defaults talk to real servers. Tests swap individual factories for
/// fakes with the `with_*` methods.
#[derive(Clone)]
pub struct Connectors {
    pub database: Arc<dyn DatabaseConnector>,
    pub broker: Arc<dyn BrokerConnector>,
    pub policy_store: Arc<dyn PolicyStoreConnector>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Connectors {
    pub fn with_database(mut self, connector: impl DatabaseConnector + 'static) -> Self {
        self.database = Arc::new(connector);
        self
    }

    pub fn with_broker(mut self, connector: impl BrokerConnector + 'static) -> Self {
        self.broker = Arc::new(connector);
        self
    }

    pub fn with_policy_store(mut self, connector: impl PolicyStoreConnector + 'static) -> Self {
        self.policy_store = Arc::new(connector);
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            database: default_database(),
            broker: default_broker(),
            policy_store: default_policy_store(),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

#[cfg(feature = "postgres")]
fn default_database() -> Arc<dyn DatabaseConnector> {
    Arc::new(crate::postgres::PostgresConnector)
}

#[cfg(not(feature = "postgres"))]
fn default_database() -> Arc<dyn DatabaseConnector> {
    Arc::new(crate::database::NoDatabaseDriver)
}

#[cfg(feature = "postgres")]
fn default_policy_store() -> Arc<dyn PolicyStoreConnector> {
    Arc::new(crate::postgres::PostgresPolicyStoreConnector)
}

#[cfg(not(feature = "postgres"))]
fn default_policy_store() -> Arc<dyn PolicyStoreConnector> {
    Arc::new(crate::policy::NoPolicyStoreDriver)
}

#[cfg(feature = "nats")]
fn default_broker() -> Arc<dyn BrokerConnector> {
    Arc::new(crate::nats::NatsConnector)
}

#[cfg(not(feature = "nats"))]
fn default_broker() -> Arc<dyn BrokerConnector> {
    Arc::new(crate::messaging::NoBrokerClient)
}
