//! PostgreSQL backends: the relational pool and the policy rule store.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};

use crate::config::{DatabaseConfig, PolicyConfig};
use crate::database::{DatabaseConnector, DatabasePool};
use crate::policy::{Effect, PolicyStore, PolicyStoreConnector, Rule};

const MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn connect_options(
    host: &str,
    port: u16,
    name: &str,
    user: &str,
    password: &str,
    sslmode: &str,
) -> anyhow::Result<PgConnectOptions> {
    let ssl_mode = if sslmode.is_empty() {
        PgSslMode::Prefer
    } else {
        sslmode.parse::<PgSslMode>()?
    };
    Ok(PgConnectOptions::new()
        .host(host)
        .port(port)
        .database(name)
        .username(user)
        .password(password)
        .ssl_mode(ssl_mode))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    async fn open(&self, config: &DatabaseConfig) -> anyhow::Result<Arc<dyn DatabasePool>> {
        let options = connect_options(
            &config.host,
            config.port,
            &config.name,
            &config.user,
            &config.password,
            &config.sslmode,
        )?;
        let max = config.max_open_conn.max(1);
        let pool = PgPoolOptions::new()
            .max_connections(max)
            .min_connections(config.max_idle_conn.min(max))
            .max_lifetime(MAX_LIFETIME)
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await?;
        tracing::info!(host = %config.host, database = %config.name, "database pool opened");
        Ok(Arc::new(PostgresPool { pool }))
    }
}

/// sqlx pool. Handlers reach it with
/// `ctx.get_database()?.downcast_ref::<PostgresPool>()`.
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresPolicyStoreConnector;

#[async_trait]
impl PolicyStoreConnector for PostgresPolicyStoreConnector {
    async fn open(&self, config: &PolicyConfig) -> anyhow::Result<Arc<dyn PolicyStore>> {
        let table = checked_table(&config.table)?;
        let options = connect_options(
            &config.host,
            config.port,
            &config.name,
            &config.user,
            &config.password,
            &config.sslmode,
        )?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = PostgresPolicyStore { pool, table };
        store.create_table().await?;
        Ok(Arc::new(store))
    }
}

fn checked_table(table: &str) -> anyhow::Result<String> {
    let valid = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")?;
    anyhow::ensure!(valid.is_match(table), "invalid policy table name `{table}`");
    Ok(table.to_string())
}

/// Rules kept in a casbin-style table: `ptype = 'p'`, `v0..v3` holding
/// subject, object, action and effect.
pub struct PostgresPolicyStore {
    pool: PgPool,
    table: String,
}

impl PostgresPolicyStore {
    async fn create_table(&self) -> anyhow::Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id SERIAL PRIMARY KEY, \
                ptype VARCHAR(12) NOT NULL, \
                v0 VARCHAR(256), v1 VARCHAR(256), v2 VARCHAR(256), \
                v3 VARCHAR(256), v4 VARCHAR(256), v5 VARCHAR(256))",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

type RuleRow = (Option<String>, Option<String>, Option<String>, Option<String>);

fn rule_from_row((v0, v1, v2, v3): RuleRow) -> Option<Rule> {
    let effect = match v3.as_deref() {
        None | Some("") => Effect::Allow,
        Some(other) => match other.parse::<Effect>() {
            Ok(effect) => effect,
            Err(_) => {
                tracing::warn!(effect = %other, "skipping policy row with unknown effect");
                return None;
            }
        },
    };
    Some(Rule::new(
        v0.unwrap_or_default(),
        v1.unwrap_or_default(),
        v2.unwrap_or_default(),
        effect,
    ))
}

#[async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn load(&self) -> anyhow::Result<Vec<Rule>> {
        let select = format!(
            "SELECT v0, v1, v2, v3 FROM {} WHERE ptype = 'p' ORDER BY id",
            self.table
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&select).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(rule_from_row).collect())
    }

    async fn add(&self, rules: &[Rule]) -> anyhow::Result<()> {
        let insert = format!(
            "INSERT INTO {} (ptype, v0, v1, v2, v3) VALUES ('p', $1, $2, $3, $4)",
            self.table
        );
        let mut tx = self.pool.begin().await?;
        for rule in rules {
            sqlx::query(&insert)
                .bind(&rule.subject)
                .bind(&rule.object)
                .bind(&rule.action)
                .bind(rule.effect.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, rules: &[Rule]) -> anyhow::Result<()> {
        let delete = format!(
            "DELETE FROM {} WHERE ptype = 'p' AND v0 = $1 AND v1 = $2 AND v2 = $3 \
             AND COALESCE(NULLIF(v3, ''), 'allow') = $4",
            self.table
        );
        let mut tx = self.pool.begin().await?;
        for rule in rules {
            sqlx::query(&delete)
                .bind(&rule.subject)
                .bind(&rule.object)
                .bind(&rule.action)
                .bind(rule.effect.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
