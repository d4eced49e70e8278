mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use app_kernel::config::Settings;
use app_kernel::logger::Logger;
use app_kernel::options::{
    with_broker, with_broker_retries, with_database, with_instance, with_policy_store, with_service,
    AppOption, Assembly,
};
use app_kernel::policy::{MemoryPolicyStore, Rule};
use app_kernel::{App, Capability, Error};
use async_trait::async_trait;
use common::{FakeBroker, FakeDatabase, FakePool, Fakes, DATABASE, EVERYTHING};

#[tokio::test]
async fn empty_config_attaches_nothing() {
    let fakes = Fakes::default();
    let app = fakes.builder("app:\n  name: bare\n").build().await.unwrap();

    assert!(matches!(app.get_database(), Err(Error::NotConfigured(Capability::Database))));
    assert!(matches!(app.get_http_server(), Err(Error::NotConfigured(Capability::HttpServer))));
    assert!(matches!(app.get_publisher(), Err(Error::NotConfigured(Capability::Broker))));
    assert!(matches!(
        app.get_policy_manager(),
        Err(Error::NotConfigured(Capability::PolicyEngine))
    ));
    assert!(matches!(
        app.get("/x", |_ctx: app_kernel::handler::Context| async { Ok::<_, anyhow::Error>(()) }),
        Err(Error::NotConfigured(Capability::HttpServer))
    ));
    assert_eq!(None, app.start().await.unwrap());
    assert_eq!(0, fakes.database.opens.load(Ordering::SeqCst));
}

#[tokio::test]
async fn database_section_attaches_one_shared_pool() {
    let fakes = Fakes::default();
    let app = fakes.builder(DATABASE).build().await.unwrap();

    let first = app.get_database().unwrap();
    let second = app.get_database().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.downcast_ref::<FakePool>().is_some());
    assert_eq!(1, fakes.database.opens.load(Ordering::SeqCst));
}

#[tokio::test]
async fn empty_user_fails_before_connecting() {
    let fakes = Fakes::default();
    let yaml = DATABASE.replace("user: svc", "user: \"\"");
    let err = fakes.builder(&yaml).build().await.err().unwrap();

    match &err {
        Error::OptionFailed { option, source } => {
            assert_eq!("WithDatabase", option);
            assert!(matches!(
                source.as_ref(),
                Error::ConfigurationMissing { field } if field == "database.user"
            ));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!("configuration_missing", err.kind());
    assert_eq!(0, fakes.database.opens.load(Ordering::SeqCst));
}

#[tokio::test]
async fn connection_failure_names_the_option() {
    let fakes = Fakes {
        database: FakeDatabase {
            refuse: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let err = fakes.builder(DATABASE).build().await.err().unwrap();
    assert_eq!("connection_failed", err.kind());
    assert!(err.to_string().contains("WithDatabase"));
}

#[tokio::test]
async fn broker_applied_twice_connects_once() {
    let fakes = Fakes::default();
    let yaml = "messaging:\n  pubsub_broker: nats://broker:4222\n";
    let app = fakes
        .builder(yaml)
        .options(vec![with_broker(), with_broker()])
        .build()
        .await
        .unwrap();

    assert!(app.get_publisher().is_ok());
    assert_eq!(1, fakes.broker.connects.load(Ordering::SeqCst));
}

#[tokio::test]
async fn broker_connect_is_retried_with_delay() {
    let fakes = Fakes {
        broker: FakeBroker {
            failures: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let app = fakes.builder(EVERYTHING).build().await.unwrap();

    assert_eq!(3, fakes.broker.connects.load(Ordering::SeqCst));
    assert_eq!(vec![Duration::from_millis(50); 2], fakes.sleeper.slept());
    assert_eq!(vec!["ORDERS".to_string()], *fakes.broker.connection.streams.lock());

    let ack = app
        .get_publisher()
        .unwrap()
        .publish_json("orders.created", &serde_json::json!({"id": 1}))
        .await
        .unwrap();
    assert_eq!(1, ack.sequence);
}

#[tokio::test]
async fn exhausted_broker_retries_abort_and_release_earlier_capabilities() {
    let fakes = Fakes {
        broker: FakeBroker {
            failures: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let err = fakes
        .builder(EVERYTHING)
        .options(vec![with_database(), with_broker_retries(1, Duration::from_millis(5))])
        .build()
        .await
        .err()
        .unwrap();

    assert_eq!("connection_failed", err.kind());
    assert!(err.to_string().contains("WithBroker"));
    assert_eq!(2, fakes.broker.connects.load(Ordering::SeqCst));
    assert_eq!(1, fakes.database.pool.closes.load(Ordering::SeqCst));
}

#[tokio::test]
async fn everything_enabled_attaches_everything() {
    let fakes = Fakes::default();
    let app = fakes.builder(EVERYTHING).build().await.unwrap();
    assert_eq!(
        vec![Capability::Database, Capability::Broker, Capability::PolicyEngine],
        app.attached()
    );
}

#[tokio::test]
async fn policy_store_can_be_supplied_directly() {
    let fakes = Fakes::default();
    let store = Arc::new(MemoryPolicyStore::new(vec![Rule::allow("ann", "login", "execute")]));
    let app = fakes
        .builder("app:\n  name: authz\n")
        .options(vec![with_policy_store(store)])
        .build()
        .await
        .unwrap();

    let policy = app.get_policy_manager().unwrap();
    assert!(policy.can_user_login("ann").unwrap());
    assert!(!policy.can_user_login("bob").unwrap());
}

struct NeedsDatabase;

#[async_trait]
impl AppOption for NeedsDatabase {
    fn requires(&self) -> &[Capability] {
        &[Capability::Database]
    }

    async fn apply(&self, _assembly: &mut Assembly) -> app_kernel::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn options_run_in_order_and_check_preconditions() {
    let fakes = Fakes::default();
    let err = fakes
        .builder("app:\n  name: bare\n")
        .option(NeedsDatabase)
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::PreconditionViolation { ref option, missing: Capability::Database } if option == "NeedsDatabase"
    ));

    let app = fakes
        .builder(DATABASE)
        .options(vec![with_database()])
        .option(NeedsDatabase)
        .build()
        .await
        .unwrap();
    assert!(app.get_database().is_ok());
}

struct Repository {
    pool_attached: bool,
}

#[tokio::test]
async fn services_register_and_resolve() {
    let fakes = Fakes::default();
    let err = fakes
        .builder(DATABASE)
        .options(vec![with_instance("greeting", String::from("hi"))])
        .option(
            with_service("repository", |ctx| {
                Ok(Repository {
                    pool_attached: ctx.get_database().is_ok(),
                })
            })
            .requiring(&[Capability::Database]),
        )
        .build()
        .await
        .err()
        .unwrap();
    // the repository needs the database, which the config-driven option
    // only attaches after explicit options ran
    assert_eq!("precondition_violation", err.kind());

    let app = fakes
        .builder(DATABASE)
        .options(vec![with_database(), with_instance("greeting", String::from("hi"))])
        .option(
            with_service("repository", |ctx| {
                Ok(Repository {
                    pool_attached: ctx.get_database().is_ok(),
                })
            })
            .requiring(&[Capability::Database]),
        )
        .build()
        .await
        .unwrap();

    assert_eq!("hi", app.get_service_as::<String>("greeting").unwrap().as_str());
    assert!(app.get_service_as::<Repository>("repository").unwrap().pool_attached);
    assert!(matches!(app.get_service("missing"), Err(Error::ServiceNotFound(_))));

    app.register_service("greeting", String::from("hello"));
    assert_eq!("hello", app.get_service_as::<String>("greeting").unwrap().as_str());
}

#[tokio::test]
async fn config_file_is_loaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, DATABASE).unwrap();
    let fakes = Fakes::default();

    let app = App::builder()
        .config_file(&path)
        .logger(Logger::disabled())
        .connectors(fakes.connectors())
        .build()
        .await
        .unwrap();
    assert_eq!("orders", app.settings().app_name());
    assert!(app.get_database().is_ok());
}

#[tokio::test]
async fn missing_config_file_fails_to_load() {
    let err = App::builder()
        .config_file("/definitely/not/here.yaml")
        .build()
        .await
        .err()
        .unwrap();
    assert_eq!("config_load", err.kind());
}

#[tokio::test]
async fn prebuilt_settings_are_accepted() {
    let settings = Settings::from_yaml_str("app:\n  name: prebuilt\n").unwrap();
    let app = App::builder()
        .settings(settings)
        .logger(Logger::disabled())
        .build()
        .await
        .unwrap();
    assert_eq!("prebuilt", app.settings().app_name());
}
