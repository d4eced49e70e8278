use std::fmt;
use std::future::Future;

use tracing::instrument::{Instrument, WithSubscriber};
use tracing::level_filters::LevelFilter;
use tracing::{Dispatch, Span};
use tracing_subscriber::EnvFilter;

use crate::config::{AppSection, LoggerConfig};
use crate::error::{Error, Result};

/// Structured logger owned by the application context.
///
/// Nothing is installed globally. Entry points run their work under this
/// logger with [`Logger::attach`] or [`Logger::scope`], after which the plain
/// `tracing` macros reach it.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    span: Span,
}

impl Logger {
    /// Builds a logger from the `logger` section, tagged with the service name.
    /// `prd` environments log JSON; anything else logs human-readable lines.
    pub fn new(logger: &LoggerConfig, app: &AppSection) -> Result<Self> {
        let level = parse_level(&logger.log_level)?;
        // RUST_LOG directives refine the configured level
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);
        let dispatch = if app.env == "prd" {
            Dispatch::new(builder.json().with_current_span(true).finish())
        } else {
            Dispatch::new(builder.finish())
        };
        Ok(Self::with_dispatch(dispatch, &app.name))
    }

    /// Wraps an existing subscriber, e.g. one that captures output in tests.
    pub fn with_dispatch(dispatch: Dispatch, service: &str) -> Self {
        let span = tracing::dispatcher::with_default(&dispatch, || {
            tracing::info_span!("service", service = %service)
        });
        Self { dispatch, span }
    }

    /// Logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
            span: Span::none(),
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `f` with this logger as the default subscriber.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, || self.span.in_scope(f))
    }

    /// Runs `future` with this logger as the default subscriber.
    pub fn attach<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        future
            .instrument(self.span.clone())
            .with_subscriber(self.dispatch.clone())
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Logs through a [`Logger`](crate::logger::Logger), recording every
/// `key = value` pair as its own field (by its `Display` form).
///
/// ```
/// # let logger = app_kernel::logger::Logger::disabled();
/// app_kernel::log_info!(logger, "order stored", order_id = 42, region = "eu");
/// ```
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $message:literal $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__log_event!(info, $logger, $message $(, $key = $value)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $message:literal $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__log_event!(warn, $logger, $message $(, $key = $value)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $message:literal $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__log_event!(error, $logger, $message $(, $key = $value)*)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $message:literal $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__log_event!(debug, $logger, $message $(, $key = $value)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_event {
    ($level:ident, $logger:expr, $message:literal $(, $key:ident = $value:expr)*) => {
        $logger.scope(|| $crate::__tracing::$level!($($key = %$value,)* $message))
    };
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" | "" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => Err(Error::ConfigurationInvalid {
            field: "logger.log_level".into(),
            reason: format!("unknown log level `{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capturing(level: LevelFilter) -> (Logger, Captured) {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (Logger::with_dispatch(Dispatch::new(subscriber), "billing"), out)
    }

    #[test]
    fn unknown_level_is_a_configuration_error() {
        let config = LoggerConfig {
            log_level: "loud".into(),
        };
        let err = Logger::new(&config, &AppSection::default()).unwrap_err();
        assert_eq!("configuration_invalid", err.kind());
        assert!(err.to_string().contains("logger.log_level"));
    }

    #[test]
    fn configured_level_is_the_default_filter() {
        let config = LoggerConfig {
            log_level: "warn".into(),
        };
        let logger = Logger::new(&config, &AppSection::default()).unwrap();
        logger.scope(|| {
            assert!(tracing::enabled!(tracing::Level::ERROR));
            assert!(!tracing::enabled!(tracing::Level::DEBUG));
        });
    }

    #[test]
    fn messages_carry_service_and_fields() {
        let (logger, out) = capturing(LevelFilter::INFO);
        crate::log_warn!(logger, "cache cold", entries = 0, region = "eu");
        let text = out.text();
        assert!(text.contains("cache cold"));
        assert!(text.contains("entries=0 region=eu"));
        assert!(text.contains("service=billing"));
    }

    #[test]
    fn level_filters_messages() {
        let (logger, out) = capturing(LevelFilter::WARN);
        crate::log_info!(logger, "quiet");
        crate::log_error!(logger, "loud");
        let text = out.text();
        assert!(!text.contains("quiet"));
        assert!(text.contains("loud"));
    }

    #[test]
    fn json_output_keeps_each_field() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let logger = Logger::with_dispatch(Dispatch::new(subscriber), "billing");

        crate::log_warn!(logger, "cache cold", entries = 0, region = "eu");

        let line: serde_json::Value = serde_json::from_str(out.text().trim()).unwrap();
        assert_eq!("cache cold", line["fields"]["message"]);
        assert_eq!("eu", line["fields"]["region"]);
        assert_eq!("0", line["fields"]["entries"]);
        assert_eq!("WARN", line["level"]);
    }

    #[tokio::test]
    async fn attached_futures_use_the_logger() {
        let (logger, out) = capturing(LevelFilter::INFO);
        logger
            .attach(async {
                tokio::task::yield_now().await;
                tracing::info!("inside future");
            })
            .await;
        assert!(out.text().contains("inside future"));
    }
}
