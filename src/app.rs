use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::connectors::Connectors;
use crate::context::AppContext;
use crate::error::{display_error, Error, Result};
use crate::handler::{dispatch, Context, Handler};
use crate::local::{LocalRequest, LocalResponder, LocalResponse};
use crate::logger::Logger;
use crate::options::{config_driven, AppOption, Assembly};
use crate::shutdown::ShutdownCoordinator;

pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yaml";
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// A fully assembled application.
///
/// Dereferences to its [`AppContext`] for capability and service access.
pub struct App {
    context: Arc<AppContext>,
    coordinator: ShutdownCoordinator,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    /// Loads [`DEFAULT_CONFIG_PATH`] and applies `options`, then the options
    /// the configuration enables.
    pub async fn new(options: Vec<Box<dyn AppOption>>) -> Result<Self> {
        Self::builder().options(options).build().await
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn get(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.context.get_http_server()?.get(pattern, handler)
    }

    pub fn post(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.context.get_http_server()?.post(pattern, handler)
    }

    pub fn put(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.context.get_http_server()?.put(pattern, handler)
    }

    pub fn delete(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.context.get_http_server()?.delete(pattern, handler)
    }

    pub fn patch(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.context.get_http_server()?.patch(pattern, handler)
    }

    /// Starts listening on `app.port` if a web server is attached, returning
    /// the bound address.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let Ok(server) = self.context.get_http_server() else {
            return Ok(None);
        };
        let port = self.context.settings().app_port();
        let addr = self.context.logger().attach(server.listen(port)).await?;
        Ok(Some(addr))
    }

    /// Starts, waits for Ctrl-C or SIGTERM, then shuts down within
    /// [`DEFAULT_SHUTDOWN_DEADLINE`].
    pub async fn run(&self) -> Result<()> {
        self.run_until(termination()).await
    }

    /// Starts, waits for `signal`, then shuts down within
    /// [`DEFAULT_SHUTDOWN_DEADLINE`].
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<()> {
        self.start().await?;
        signal.await;
        self.shutdown(DEFAULT_SHUTDOWN_DEADLINE).await
    }

    /// Releases every capability. Later calls return `Ok` without doing
    /// anything.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.context
            .logger()
            .attach(self.coordinator.shutdown(&self.context, deadline))
            .await
    }

    /// Runs `handler` in-process against `request`.
    pub async fn invoke(&self, handler: impl Handler, request: LocalRequest) -> LocalResponse {
        let ctx = Context::new(self.context.clone(), Box::new(request));
        self.context
            .logger()
            .attach(dispatch(&handler, ctx, LocalResponder))
            .await
    }
}

impl Deref for App {
    type Target = AppContext;

    fn deref(&self) -> &AppContext {
        &self.context
    }
}

async fn termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for ctrl-c: {e}");
            futures::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {e}");
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

enum Source {
    File(PathBuf),
    Yaml(String),
    Settings(Settings),
}

/// Collects a configuration source, collaborators and options, then
/// assembles an [`App`].
pub struct AppBuilder {
    source: Source,
    logger: Option<Logger>,
    connectors: Connectors,
    options: Vec<Box<dyn AppOption>>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            source: Source::File(PathBuf::from(DEFAULT_CONFIG_PATH)),
            logger: None,
            connectors: Connectors::default(),
            options: vec![],
        }
    }
}

impl AppBuilder {
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Source::File(path.into());
        self
    }

    pub fn config_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.source = Source::Yaml(yaml.into());
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.source = Source::Settings(settings);
        self
    }

    /// Uses `logger` instead of building one from the `logger` section.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn connectors(mut self, connectors: Connectors) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn option(mut self, option: impl AppOption + 'static) -> Self {
        self.options.push(Box::new(option));
        self
    }

    pub fn options(mut self, options: Vec<Box<dyn AppOption>>) -> Self {
        self.options.extend(options);
        self
    }

    /// Loads configuration and applies the explicit options, then the
    /// config-driven ones. The first failure aborts; whatever was attached
    /// until then is released before the error is returned.
    pub async fn build(self) -> Result<App> {
        let settings = match self.source {
            Source::File(path) => Settings::load(path)?,
            Source::Yaml(yaml) => Settings::from_yaml_str(&yaml)?,
            Source::Settings(settings) => settings,
        };
        let logger = match self.logger {
            Some(logger) => logger,
            None => Logger::new(settings.logger(), settings.app())?,
        };
        let mut options = self.options;
        let auto = config_driven(&settings, &options);
        options.extend(auto);

        let context = AppContext::new(logger.clone(), Arc::new(settings));
        let mut assembly = Assembly::new(context, self.connectors);
        if let Err(e) = logger.attach(apply_all(&options, &mut assembly)).await {
            crate::log_error!(logger, "bootstrap failed", error = display_error(&e));
            let partial = assembly.into_context();
            let _ = logger
                .attach(ShutdownCoordinator::default().shutdown(&partial, DEFAULT_SHUTDOWN_DEADLINE))
                .await;
            return Err(e);
        }

        let context = Arc::new(assembly.into_context());
        if let Ok(server) = context.get_http_server() {
            server.bind_context(Arc::downgrade(&context));
        }
        crate::log_info!(
            context.logger(),
            "application assembled",
            attached = format!("{:?}", context.attached())
        );
        Ok(App {
            context,
            coordinator: ShutdownCoordinator::default(),
        })
    }
}

async fn apply_all(options: &[Box<dyn AppOption>], assembly: &mut Assembly) -> Result<()> {
    for option in options {
        let name = option.name();
        if let Some(missing) = option
            .requires()
            .iter()
            .find(|capability| !assembly.is_attached(**capability))
        {
            return Err(Error::PreconditionViolation {
                option: name,
                missing: *missing,
            });
        }
        tracing::debug!(option = %name, "applying option");
        option
            .apply(assembly)
            .await
            .map_err(|e| Error::OptionFailed {
                option: name,
                source: Box::new(e),
            })?;
    }
    Ok(())
}
