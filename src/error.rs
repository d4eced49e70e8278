use std::fmt;

use crate::context::Capability;

/// Boxed cause carried by errors that wrap a collaborator failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration could not be loaded: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("missing required configuration field `{field}`")]
    ConfigurationMissing { field: String },

    #[error("invalid configuration field `{field}`: {reason}")]
    ConfigurationInvalid { field: String, reason: String },

    #[error("failed to connect {capability}: {source}")]
    ConnectionFailed {
        capability: Capability,
        #[source]
        source: BoxError,
    },

    #[error("{0} is not configured")]
    NotConfigured(Capability),

    #[error("service `{0}` is not registered")]
    ServiceNotFound(String),

    #[error("option `{option}` requires the {missing} to be attached first")]
    PreconditionViolation { option: String, missing: Capability },

    #[error("option `{option}` failed: {source}")]
    OptionFailed {
        option: String,
        #[source]
        source: Box<Error>,
    },

    #[error("publish to `{subject}` failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        subject: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("policy error: {0}")]
    Policy(String),

    #[error("policy store error: {0}")]
    PolicyStore(#[source] BoxError),

    #[error("{capability} did not stop within {deadline:?}")]
    ShutdownTimeout {
        capability: Capability,
        deadline: std::time::Duration,
    },

    #[error("shutdown finished with {} failure(s): {}", .0.len(), ShutdownFailure::join(.0))]
    ShutdownPartialFailure(Vec<ShutdownFailure>),
}

impl Error {
    pub(crate) fn connection(capability: Capability, source: impl Into<BoxError>) -> Self {
        Error::ConnectionFailed {
            capability,
            source: source.into(),
        }
    }

    pub(crate) fn missing(field: impl Into<String>) -> Self {
        Error::ConfigurationMissing {
            field: field.into(),
        }
    }

    /// Follows `OptionFailed` wrappers down to the error that caused them.
    pub fn root(&self) -> &Error {
        match self {
            Error::OptionFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::ConfigLoad(_) => "config_load",
            Error::ConfigurationMissing { .. } => "configuration_missing",
            Error::ConfigurationInvalid { .. } => "configuration_invalid",
            Error::ConnectionFailed { .. } => "connection_failed",
            Error::NotConfigured(_) => "not_configured",
            Error::ServiceNotFound(_) => "service_not_found",
            Error::PreconditionViolation { .. } => "precondition_violation",
            Error::OptionFailed { .. } => "option_failed",
            Error::PublishFailed { .. } => "publish_failed",
            Error::Policy(_) => "policy",
            Error::PolicyStore(_) => "policy_store",
            Error::ShutdownTimeout { .. } => "shutdown_timeout",
            Error::ShutdownPartialFailure(_) => "shutdown_partial_failure",
        }
    }

    /// HTTP-status-like code reported to callers of request handlers.
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Error::NotConfigured(_) | Error::ConnectionFailed { .. } => 503,
            _ => 500,
        }
    }
}

/// A capability that could not be released cleanly during shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownFailure {
    pub capability: Capability,
    pub reason: String,
}

impl ShutdownFailure {
    fn join(failures: &[ShutdownFailure]) -> String {
        failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.capability, self.reason)
    }
}

/// Enables logging of errors, to move forward without returning the error.
pub trait LogError<T>: Sized {
    /// Lazily logs if there was an error with a message and returns the result unchanged
    fn log_with_context_passthrough<Ctx: Fn() -> String>(self, ctx: Ctx) -> Self {
        self.log_with_context_as_passthrough(tracing::log::Level::Error, ctx)
    }
    /// Lazily logs if there was an error with a message at the provided log level, and returns the result unchanged
    fn log_with_context_as_passthrough<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Self;
}

impl<T, E: std::fmt::Display + 'static> LogError<T> for Result<T, E> {
    fn log_with_context_as_passthrough<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Self {
        self.map_err(|e| {
            let ctx = ctx();
            let es = display_error(&e);
            log!(level, "error: `{ctx}` - {es}");
            e
        })
    }
}

macro_rules! log {
    ($level:expr, $($args:tt),*) => {
        match $level {
            tracing::log::Level::Error => tracing::error!($($args),*),
            tracing::log::Level::Warn => tracing::warn!($($args),*),
            tracing::log::Level::Info => tracing::info!($($args),*),
            tracing::log::Level::Debug => tracing::debug!($($args),*),
            tracing::log::Level::Trace => tracing::trace!($($args),*),
        };
    };
}
pub(crate) use log;

/// use this to make sure you have a descriptive message including the cause
/// chain for anyhow and crate errors, and otherwise just display the normal
/// string for other errors. anyhow errors also get their backtrace.
pub fn display_error<E: std::fmt::Display + 'static>(e: &E) -> String {
    let mut s = display_chain(e);
    if let Some(e) = (e as &dyn std::any::Any).downcast_ref::<anyhow::Error>() {
        s.push_str(&format!("\nstack backtrace:\n{}", e.backtrace()));
    }
    s
}

/// The message and its causes on one line, without a backtrace. Safe to
/// hand to clients.
pub fn display_chain<E: std::fmt::Display + 'static>(e: &E) -> String {
    let any = e as &dyn std::any::Any;
    if let Some(e) = any.downcast_ref::<anyhow::Error>() {
        return join_causes(e.to_string(), e.chain().skip(1));
    }
    if let Some(e) = any.downcast_ref::<Error>() {
        let mut causes = vec![];
        let mut cause = std::error::Error::source(e);
        while let Some(c) = cause {
            causes.push(c);
            cause = c.source();
        }
        return join_causes(e.to_string(), causes.into_iter());
    }
    format!("{e}")
}

// most variants already print their direct cause
fn join_causes<'a>(
    mut s: String,
    causes: impl Iterator<Item = &'a (dyn std::error::Error + 'static)>,
) -> String {
    for cause in causes {
        let cause = cause.to_string();
        if !s.contains(&cause) {
            s.push_str(", caused by: ");
            s.push_str(&cause);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_failure_reports_root_kind_and_status() {
        let err = Error::OptionFailed {
            option: "database".into(),
            source: Box::new(Error::NotConfigured(Capability::Database)),
        };
        assert_eq!("not_configured", err.kind());
        assert_eq!(503, err.status_code());
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn display_error_includes_cause_chain() {
        let err = Error::connection(Capability::Broker, std::io::Error::other("refused"));
        let shown = display_error(&err);
        assert_eq!("failed to connect message broker: refused", shown);

        let nested = Error::connection(
            Capability::Broker,
            anyhow::anyhow!("connection reset").context("creating stream `ORDERS`"),
        );
        assert_eq!(
            "failed to connect message broker: creating stream `ORDERS`, caused by: connection reset",
            display_chain(&nested)
        );
    }

    #[test]
    fn chain_never_carries_a_backtrace() {
        let err = anyhow::anyhow!("connection reset").context("database");
        assert_eq!("database, caused by: connection reset", display_chain(&err));
        assert!(display_error(&err).contains("stack backtrace"));
    }

    #[test]
    fn partial_failure_lists_every_capability() {
        let err = Error::ShutdownPartialFailure(vec![
            ShutdownFailure {
                capability: Capability::HttpServer,
                reason: "drain timed out".into(),
            },
            ShutdownFailure {
                capability: Capability::Database,
                reason: "closed twice".into(),
            },
        ]);
        let shown = err.to_string();
        assert!(shown.contains("2 failure(s)"));
        assert!(shown.contains("web server: drain timed out"));
        assert!(shown.contains("database: closed twice"));
    }
}
