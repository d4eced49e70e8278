use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::config::Settings;
use crate::database::DatabasePool;
use crate::error::{Error, Result};
use crate::http::HttpServer;
use crate::logger::Logger;
use crate::messaging::Publisher;
use crate::policy::PolicyManager;
use crate::registry::{CapabilityRegistry, Instance};

/// Subsystems that can be attached to an [`AppContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Logger,
    Database,
    HttpServer,
    Broker,
    PolicyEngine,
}

impl Capability {
    /// Every capability that can be missing.
    pub const OPTIONAL: [Capability; 4] = [
        Capability::Database,
        Capability::HttpServer,
        Capability::Broker,
        Capability::PolicyEngine,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Logger => "logger",
            Capability::Database => "database",
            Capability::HttpServer => "web server",
            Capability::Broker => "message broker",
            Capability::PolicyEngine => "policy engine",
        })
    }
}

/// Everything a service shares across requests: logger, configuration,
/// named services and whichever capabilities bootstrap attached.
///
/// Capability slots are filled during bootstrap only. Once the context is
/// shared behind an `Arc` the slots can no longer change; the registry is
/// the one part that stays writable.
pub struct AppContext {
    logger: Logger,
    settings: Arc<Settings>,
    registry: CapabilityRegistry,
    database: Option<Arc<dyn DatabasePool>>,
    http_server: Option<Arc<HttpServer>>,
    publisher: Option<Arc<Publisher>>,
    policy_manager: Option<Arc<PolicyManager>>,
}

impl AppContext {
    pub fn new(logger: Logger, settings: Arc<Settings>) -> Self {
        Self {
            logger,
            settings,
            registry: CapabilityRegistry::new(),
            database: None,
            http_server: None,
            publisher: None,
            policy_manager: None,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn get_database(&self) -> Result<Arc<dyn DatabasePool>> {
        attached(&self.database, Capability::Database)
    }

    pub fn get_http_server(&self) -> Result<Arc<HttpServer>> {
        attached(&self.http_server, Capability::HttpServer)
    }

    pub fn get_publisher(&self) -> Result<Arc<Publisher>> {
        attached(&self.publisher, Capability::Broker)
    }

    pub fn get_policy_manager(&self) -> Result<Arc<PolicyManager>> {
        attached(&self.policy_manager, Capability::PolicyEngine)
    }

    pub fn get_service(&self, name: &str) -> Result<Instance> {
        self.registry
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Looks up a service and checks its type. A missing name and a type
    /// mismatch both report `ServiceNotFound`.
    pub fn get_service_as<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.registry
            .get_typed::<T>(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Registers a service, warning when it replaces an existing one.
    pub fn register_service<T: Any + Send + Sync>(&self, name: &str, instance: T) {
        if self.registry.register(name, instance).is_some() {
            crate::log_warn!(self.logger, "service replaced", name = name);
        }
    }

    pub fn is_attached(&self, capability: Capability) -> bool {
        match capability {
            Capability::Logger => true,
            Capability::Database => self.database.is_some(),
            Capability::HttpServer => self.http_server.is_some(),
            Capability::Broker => self.publisher.is_some(),
            Capability::PolicyEngine => self.policy_manager.is_some(),
        }
    }

    /// Attached optional capabilities, in declaration order.
    pub fn attached(&self) -> Vec<Capability> {
        Capability::OPTIONAL
            .into_iter()
            .filter(|c| self.is_attached(*c))
            .collect()
    }

    pub(crate) fn set_logger(&mut self, logger: Logger) {
        self.logger = logger;
    }

    pub(crate) fn attach_database(&mut self, pool: Arc<dyn DatabasePool>) {
        self.database.get_or_insert(pool);
    }

    pub(crate) fn attach_http_server(&mut self, server: Arc<HttpServer>) {
        self.http_server.get_or_insert(server);
    }

    pub(crate) fn attach_publisher(&mut self, publisher: Arc<Publisher>) {
        self.publisher.get_or_insert(publisher);
    }

    pub(crate) fn attach_policy_manager(&mut self, manager: Arc<PolicyManager>) {
        self.policy_manager.get_or_insert(manager);
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("app", &self.settings.app_name())
            .field("attached", &self.attached())
            .field("services", &self.registry.names())
            .finish()
    }
}

fn attached<T: ?Sized>(slot: &Option<Arc<T>>, capability: Capability) -> Result<Arc<T>> {
    slot.clone().ok_or(Error::NotConfigured(capability))
}
