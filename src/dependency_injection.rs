use std::any::Any;
use std::sync::Arc;

use crate::context::AppContext;
use crate::database::DatabasePool;
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::registry::Instance;

/// Resolves a dependency of type `T` by name.
pub trait Provides<T> {
    fn provide(&self, name: &str) -> Result<T>;
}

/// `Arc<T>` comes from the service registered under `name`, or else from an
/// attached capability of that type (publisher, policy manager, web server,
/// settings).
impl<T: Any + Send + Sync> Provides<Arc<T>> for AppContext {
    fn provide(&self, name: &str) -> Result<Arc<T>> {
        if let Some(service) = self.registry().get_typed::<T>(name) {
            return Ok(service);
        }
        attached_as::<T>(self).ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }
}

impl Provides<Arc<dyn DatabasePool>> for AppContext {
    fn provide(&self, _name: &str) -> Result<Arc<dyn DatabasePool>> {
        self.get_database()
    }
}

impl Provides<Logger> for AppContext {
    fn provide(&self, _name: &str) -> Result<Logger> {
        Ok(self.logger().clone())
    }
}

fn attached_as<T: Any + Send + Sync>(ctx: &AppContext) -> Option<Arc<T>> {
    let candidates: [Option<Instance>; 4] = [
        ctx.get_publisher().ok().map(|p| p as Instance),
        ctx.get_policy_manager().ok().map(|p| p as Instance),
        ctx.get_http_server().ok().map(|s| s as Instance),
        Some(ctx.settings().clone() as Instance),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|instance| instance.downcast::<T>().ok())
}

/// Declares a struct whose fields are resolved from an
/// [`AppContext`](crate::context::AppContext) by field name, generating
/// `TryFrom<&AppContext>`.
///
/// ```rust
/// use std::sync::Arc;
///
/// use app_kernel::{config::Settings, inject, logger::Logger};
///
/// pub struct Mailer;
///
/// inject!(
///     pub struct Notifications {
///         mailer: Arc<Mailer>,
///         settings: Arc<Settings>,
///         logger: Logger,
///     }
/// );
/// ```
#[macro_export]
macro_rules! inject {
    (
        $(#[$outer:meta])*
        $viz:vis struct $Name:ident {
            $($fviz:vis $field:ident: $FieldType:ty),*$(,)?
        }
    ) => {
        $(#[$outer])*
        $viz struct $Name {
            $($fviz $field: $FieldType),*
        }
        impl TryFrom<&$crate::context::AppContext> for $Name {
            type Error = $crate::Error;

            #[allow(unused_variables)]
            fn try_from(ctx: &$crate::context::AppContext) -> ::std::result::Result<Self, $crate::Error> {
                Ok(Self {
                    $($field: <$crate::context::AppContext as $crate::dependency_injection::Provides<$FieldType>>::provide(ctx, stringify!($field))?),*
                })
            }
        }
    };
}
