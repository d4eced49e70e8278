//! Units of bootstrap logic.
//!
//! An option attaches one capability or registers one service. The
//! orchestrator applies options strictly in order; the first failure aborts
//! the whole bootstrap.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{DatabaseConfig, PolicyConfig, Settings};
use crate::connectors::Connectors;
use crate::context::{AppContext, Capability};
use crate::database::{self, DatabasePool};
use crate::error::{Error, Result};
use crate::health;
use crate::http::HttpServer;
use crate::logger::Logger;
use crate::messaging::{Publisher, RetryPolicy};
use crate::policy::{PolicyManager, PolicyStore};
use crate::registry::Instance;
use crate::short_name;

/// A named step that mutates the application under construction.
#[async_trait]
pub trait AppOption: Send + Sync {
    /// The name used to identify the option in logs and errors.
    fn name(&self) -> String {
        short_name::<Self>()
    }

    /// Capability this option attaches. An explicit option for a capability
    /// keeps the orchestrator from adding its config-driven counterpart.
    fn provides(&self) -> Option<Capability> {
        None
    }

    /// Capabilities that must be attached before this option runs.
    fn requires(&self) -> &[Capability] {
        &[]
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()>;
}

/// The application while options are being applied.
pub struct Assembly {
    context: AppContext,
    connectors: Connectors,
}

impl Assembly {
    pub(crate) fn new(context: AppContext, connectors: Connectors) -> Self {
        Self {
            context,
            connectors,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn settings(&self) -> &Settings {
        self.context.settings()
    }

    pub fn logger(&self) -> &Logger {
        self.context.logger()
    }

    pub fn connectors(&self) -> &Connectors {
        &self.connectors
    }

    pub fn is_attached(&self, capability: Capability) -> bool {
        self.context.is_attached(capability)
    }

    pub fn set_logger(&mut self, logger: Logger) {
        self.context.set_logger(logger);
    }

    pub fn attach_database(&mut self, pool: Arc<dyn DatabasePool>) {
        self.context.attach_database(pool);
    }

    pub fn attach_http_server(&mut self, server: Arc<HttpServer>) {
        self.context.attach_http_server(server);
    }

    pub fn attach_publisher(&mut self, publisher: Arc<Publisher>) {
        self.context.attach_publisher(publisher);
    }

    pub fn attach_policy_manager(&mut self, manager: Arc<PolicyManager>) {
        self.context.attach_policy_manager(manager);
    }

    pub(crate) fn into_context(self) -> AppContext {
        self.context
    }

    fn skip_attached(&self, capability: Capability) -> bool {
        let attached = self.is_attached(capability);
        if attached {
            tracing::debug!(%capability, "already attached, skipping");
        }
        attached
    }
}

/// Replaces the logger built from configuration.
pub struct WithLogger(pub Logger);

#[async_trait]
impl AppOption for WithLogger {
    fn provides(&self) -> Option<Capability> {
        Some(Capability::Logger)
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        assembly.set_logger(self.0.clone());
        Ok(())
    }
}

/// Opens the relational pool, from the `database` section unless a config
/// is given.
#[derive(Default)]
pub struct WithDatabase {
    pub config: Option<DatabaseConfig>,
}

#[async_trait]
impl AppOption for WithDatabase {
    fn provides(&self) -> Option<Capability> {
        Some(Capability::Database)
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        if assembly.skip_attached(Capability::Database) {
            return Ok(());
        }
        let config = self
            .config
            .clone()
            .unwrap_or_else(|| assembly.settings().database().clone());
        database::validate(&config)?;
        let pool = assembly
            .connectors()
            .database
            .open(&config)
            .await
            .map_err(|e| Error::connection(Capability::Database, e))?;
        assembly.attach_database(pool);
        Ok(())
    }
}

/// Connects the broker publisher, creating the configured streams.
///
/// Retry count and delay default to the `messaging` section and apply to the
/// connection attempt and to every later publish.
#[derive(Default)]
pub struct WithBroker {
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

#[async_trait]
impl AppOption for WithBroker {
    fn provides(&self) -> Option<Capability> {
        Some(Capability::Broker)
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        if assembly.skip_attached(Capability::Broker) {
            return Ok(());
        }
        let messaging = assembly.settings().messaging().clone();
        if messaging.pubsub_broker.is_empty() {
            return Err(Error::missing("messaging.pubsub_broker"));
        }
        let retry = RetryPolicy::new(
            self.retries.unwrap_or(messaging.retries),
            self.retry_delay.unwrap_or_else(|| messaging.retry_delay()),
        );
        let connector = assembly.connectors().broker.clone();
        let sleeper = assembly.connectors().sleeper.clone();
        let url = messaging.pubsub_broker.as_str();

        let connection = retry
            .run(sleeper.as_ref(), "broker connect", || connector.connect(url))
            .await
            .map_err(|(e, _)| Error::connection(Capability::Broker, e))?;
        for stream in &messaging.streams {
            if let Err(e) = connection.ensure_stream(stream).await {
                let _ = connection.close().await;
                return Err(Error::connection(
                    Capability::Broker,
                    e.context(format!("creating stream `{}`", stream.stream_name)),
                ));
            }
        }
        assembly.attach_publisher(Arc::new(Publisher::new(connection, retry, sleeper)));
        Ok(())
    }
}

enum PolicySource {
    Config(Option<PolicyConfig>),
    Store(Arc<dyn PolicyStore>),
}

/// Loads the policy engine, from the `auth.policy` section unless a config
/// or a ready store is given.
pub struct WithPolicyManager {
    source: PolicySource,
}

impl WithPolicyManager {
    pub fn from_config(config: Option<PolicyConfig>) -> Self {
        Self {
            source: PolicySource::Config(config),
        }
    }

    pub fn from_store(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            source: PolicySource::Store(store),
        }
    }
}

fn validate_policy(config: &PolicyConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(Error::missing("auth.policy.host"));
    }
    if config.port == 0 {
        return Err(Error::missing("auth.policy.port"));
    }
    if config.name.is_empty() {
        return Err(Error::missing("auth.policy.name"));
    }
    if config.user.is_empty() {
        return Err(Error::missing("auth.policy.user"));
    }
    Ok(())
}

#[async_trait]
impl AppOption for WithPolicyManager {
    fn provides(&self) -> Option<Capability> {
        Some(Capability::PolicyEngine)
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        if assembly.skip_attached(Capability::PolicyEngine) {
            return Ok(());
        }
        let store = match &self.source {
            PolicySource::Store(store) => store.clone(),
            PolicySource::Config(config) => {
                let config = config
                    .clone()
                    .or_else(|| assembly.settings().auth().policy.clone())
                    .ok_or_else(|| Error::missing("auth.policy"))?;
                validate_policy(&config)?;
                assembly
                    .connectors()
                    .policy_store
                    .open(&config)
                    .await
                    .map_err(|e| Error::connection(Capability::PolicyEngine, e))?
            }
        };
        let manager = PolicyManager::new(store).await?;
        assembly.attach_policy_manager(Arc::new(manager));
        Ok(())
    }
}

/// Creates the web server with the built-in health routes. It starts
/// listening when the application starts.
#[derive(Default)]
pub struct WithHttpServer;

#[async_trait]
impl AppOption for WithHttpServer {
    fn provides(&self) -> Option<Capability> {
        Some(Capability::HttpServer)
    }

    fn requires(&self) -> &[Capability] {
        &[Capability::Logger]
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        if assembly.skip_attached(Capability::HttpServer) {
            return Ok(());
        }
        let server = HttpServer::new(assembly.settings().app(), assembly.logger().clone());
        health::register(&server)?;
        assembly.attach_http_server(Arc::new(server));
        Ok(())
    }
}

type Factory = Box<dyn Fn(&AppContext) -> Result<Instance> + Send + Sync>;

/// Registers a named service, built from the application assembled so far.
pub struct WithService {
    name: String,
    requires: Vec<Capability>,
    factory: Factory,
}

impl WithService {
    /// Capabilities the factory reads; checked before it runs.
    pub fn requiring(mut self, capabilities: &[Capability]) -> Self {
        self.requires.extend_from_slice(capabilities);
        self
    }
}

#[async_trait]
impl AppOption for WithService {
    fn name(&self) -> String {
        format!("WithService({})", self.name)
    }

    fn requires(&self) -> &[Capability] {
        &self.requires
    }

    async fn apply(&self, assembly: &mut Assembly) -> Result<()> {
        let instance = (self.factory)(assembly.context())?;
        if assembly
            .context()
            .registry()
            .register_instance(self.name.clone(), instance)
            .is_some()
        {
            crate::log_warn!(assembly.logger(), "service replaced", name = self.name);
        }
        Ok(())
    }
}

pub fn with_logger(logger: Logger) -> Box<dyn AppOption> {
    Box::new(WithLogger(logger))
}

pub fn with_database() -> Box<dyn AppOption> {
    Box::new(WithDatabase::default())
}

pub fn with_database_config(config: DatabaseConfig) -> Box<dyn AppOption> {
    Box::new(WithDatabase {
        config: Some(config),
    })
}

pub fn with_broker() -> Box<dyn AppOption> {
    Box::new(WithBroker::default())
}

pub fn with_broker_retries(retries: u32, retry_delay: Duration) -> Box<dyn AppOption> {
    Box::new(WithBroker {
        retries: Some(retries),
        retry_delay: Some(retry_delay),
    })
}

pub fn with_policy_manager() -> Box<dyn AppOption> {
    Box::new(WithPolicyManager::from_config(None))
}

pub fn with_policy_store(store: Arc<dyn PolicyStore>) -> Box<dyn AppOption> {
    Box::new(WithPolicyManager::from_store(store))
}

pub fn with_http_server() -> Box<dyn AppOption> {
    Box::new(WithHttpServer)
}

/// Registers whatever `factory` builds from the context.
pub fn with_service<T, F>(name: impl Into<String>, factory: F) -> WithService
where
    T: Any + Send + Sync,
    F: Fn(&AppContext) -> Result<T> + Send + Sync + 'static,
{
    WithService {
        name: name.into(),
        requires: vec![],
        factory: Box::new(move |ctx| Ok(Arc::new(factory(ctx)?) as Instance)),
    }
}

/// Registers a ready instance.
pub fn with_instance<T: Any + Send + Sync>(name: impl Into<String>, instance: T) -> Box<dyn AppOption> {
    let instance: Instance = Arc::new(instance);
    Box::new(WithService {
        name: name.into(),
        requires: vec![],
        factory: Box::new(move |_| Ok(instance.clone())),
    })
}

/// Registers a service declared with [`inject!`](crate::inject), resolving
/// its fields from the context.
pub fn with_injected<T>(name: impl Into<String>) -> Box<dyn AppOption>
where
    T: for<'a> TryFrom<&'a AppContext, Error = Error> + Any + Send + Sync,
{
    Box::new(with_service(name, |ctx| T::try_from(ctx)))
}

/// Options for every capability the configuration enables, in fixed order,
/// skipping capabilities an explicit option already provides.
pub(crate) fn config_driven(
    settings: &Settings,
    explicit: &[Box<dyn AppOption>],
) -> Vec<Box<dyn AppOption>> {
    let enabled = settings.enabled();
    let provided: Vec<Capability> = explicit.iter().filter_map(|o| o.provides()).collect();
    let candidates: [(bool, Capability, fn() -> Box<dyn AppOption>); 4] = [
        (enabled.database, Capability::Database, with_database),
        (enabled.messaging, Capability::Broker, with_broker),
        (enabled.policy, Capability::PolicyEngine, with_policy_manager),
        (enabled.http, Capability::HttpServer, with_http_server),
    ];
    candidates
        .into_iter()
        .filter(|(on, capability, _)| *on && !provided.contains(capability))
        .map(|(_, _, make)| make())
        .collect()
}
