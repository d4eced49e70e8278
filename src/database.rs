use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// A relational connection pool attached to the application.
///
/// The pool is opened once during bootstrap and shared by every request.
/// Handler code reaches the concrete pool with [`downcast_ref`].
///
/// [`downcast_ref`]: trait.DatabasePool.html#method.downcast_ref
#[async_trait]
pub trait DatabasePool: Any + Send + Sync {
    /// Round trip to the server, for health checks.
    async fn ping(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn DatabasePool {
    pub fn downcast_ref<T: DatabasePool>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Opens pools. Swapped out in tests.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn open(&self, config: &DatabaseConfig) -> anyhow::Result<Arc<dyn DatabasePool>>;
}

/// Checks the fields a pool cannot be opened without, in the order a
/// connection string needs them.
pub fn validate(config: &DatabaseConfig) -> Result<()> {
    if config.user.is_empty() {
        return Err(Error::missing("database.user"));
    }
    if config.host.is_empty() {
        return Err(Error::missing("database.host"));
    }
    if config.port == 0 {
        return Err(Error::missing("database.port"));
    }
    if config.name.is_empty() {
        return Err(Error::missing("database.name"));
    }
    if config.kind != "postgres" {
        return Err(Error::ConfigurationInvalid {
            field: "database.type".into(),
            reason: format!("unsupported database type `{}`", config.kind),
        });
    }
    Ok(())
}

/// Connector used when the crate is built without a database driver.
pub struct NoDatabaseDriver;

#[async_trait]
impl DatabaseConnector for NoDatabaseDriver {
    async fn open(&self, _config: &DatabaseConfig) -> anyhow::Result<Arc<dyn DatabasePool>> {
        anyhow::bail!("built without the `postgres` feature, no database driver available")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.local".into(),
            port: 5432,
            name: "orders".into(),
            user: "svc".into(),
            ..Default::default()
        }
    }

    #[test]
    fn complete_config_is_valid() {
        assert!(validate(&complete()).is_ok());
    }

    #[test]
    fn empty_user_is_reported_first() {
        let config = DatabaseConfig {
            user: String::new(),
            host: String::new(),
            ..complete()
        };
        match validate(&config) {
            Err(Error::ConfigurationMissing { field }) => assert_eq!("database.user", field),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn zero_port_is_missing() {
        let config = DatabaseConfig {
            port: 0,
            ..complete()
        };
        assert!(matches!(
            validate(&config),
            Err(Error::ConfigurationMissing { field }) if field == "database.port"
        ));
    }

    #[test]
    fn only_postgres_is_supported() {
        let config = DatabaseConfig {
            kind: "mysql".into(),
            ..complete()
        };
        assert_eq!("configuration_invalid", validate(&config).unwrap_err().kind());
    }

    struct Dummy;

    #[async_trait]
    impl DatabasePool for Dummy {
        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn handles_downcast_to_the_concrete_pool() {
        let pool: Arc<dyn DatabasePool> = Arc::new(Dummy);
        assert!(pool.downcast_ref::<Dummy>().is_some());
    }
}
