mod common;

use std::sync::Arc;

use common::{fake, source, Fault, Journal, RecordingEngine};
use trestle_core::{
    Host, HostConfig, HostError, LifecycleState, EXIT_ACTIVATION_FAILURE, EXIT_STARTUP_FAILURE,
};
use trestle_plugin_sdk::MemorySink;

fn config(strict: bool) -> HostConfig {
    let raw = format!(
        r#"
        [[listeners]]
        name = "test"
        bind = "127.0.0.1:0"

        [lifecycle]
        strict = {strict}
        hook_timeout_ms = 200

        [settings.a]
        hostname = "alpha"
        "#
    );
    HostConfig::from_toml_str(&raw).unwrap()
}

#[tokio::test]
async fn serves_started_plugins_then_stops_them() {
    let journal = Journal::default();
    let engine = RecordingEngine::default();
    let host = Host::new(config(false)).with_source(source(vec![
        fake("b", &journal).deps(&["a"]),
        fake("a", &journal),
    ]));

    let summary = host.run_with(engine.clone(), async {}).await.unwrap();

    assert_eq!(engine.runs(), 1);
    assert_eq!(engine.owners(), vec!["a", "b"]);
    assert_eq!(summary.routes_bound, 2);
    assert_eq!(journal.hook("stop"), vec!["b", "a"]);
    assert!(summary
        .plugins
        .iter()
        .all(|p| p.state == LifecycleState::Stopped));
}

#[tokio::test]
async fn best_effort_mode_serves_without_failed_plugins() {
    let journal = Journal::default();
    let engine = RecordingEngine::default();
    let host = Host::new(config(false)).with_source(source(vec![
        fake("a", &journal).fault(Fault::InitError),
        fake("b", &journal).deps(&["a"]),
    ]));

    let summary = host.run_with(engine.clone(), async {}).await.unwrap();

    assert_eq!(engine.runs(), 1);
    assert_eq!(engine.owners(), vec!["b"]);
    let states: Vec<_> = summary.plugins.iter().map(|p| (p.name.as_str(), p.state)).collect();
    assert_eq!(
        states,
        vec![("a", LifecycleState::Failed), ("b", LifecycleState::Stopped)]
    );
}

#[tokio::test]
async fn strict_activation_failure_never_serves() {
    let journal = Journal::default();
    let engine = RecordingEngine::default();
    let host = Host::new(config(true)).with_source(source(vec![
        fake("z", &journal),
        fake("a", &journal).deps(&["z"]).fault(Fault::StartError),
        fake("b", &journal).deps(&["a"]),
    ]));

    let err = host.run_with(engine.clone(), async {}).await.unwrap_err();

    assert_eq!(err.exit_code(), EXIT_ACTIVATION_FAILURE);
    assert!(matches!(err, HostError::Activation(ref a) if a.plugins() == vec!["a"]));
    assert_eq!(engine.runs(), 0);
    assert!(engine.bound().is_empty());
    assert!(journal.hook("init").iter().all(|name| name != "b"));
    // The already started dependency is shut down again.
    assert_eq!(journal.hook("stop"), vec!["z"]);
}

#[tokio::test]
async fn resolution_errors_abort_before_activation() {
    let journal = Journal::default();
    let engine = RecordingEngine::default();
    let host = Host::new(config(false)).with_source(source(vec![
        fake("a", &journal).deps(&["b"]),
        fake("b", &journal).deps(&["a"]),
    ]));

    let err = host.run_with(engine.clone(), async {}).await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
    assert_eq!(err.to_string(), "cyclic plugin dependency between a, b");
    assert!(journal.hook("init").is_empty());
    assert_eq!(engine.runs(), 0);

    let missing = Host::new(config(false))
        .with_source(source(vec![fake("a", &journal).deps(&["ghost"])]))
        .run_with(engine.clone(), async {})
        .await
        .unwrap_err();
    assert!(matches!(missing, HostError::Resolve(_)));
}

#[tokio::test]
async fn duplicate_plugins_are_a_discovery_error() {
    let journal = Journal::default();
    let host = Host::new(config(false)).with_source(source(vec![
        fake("a", &journal),
        fake("a", &journal),
    ]));
    let err = host
        .run_with(RecordingEngine::default(), async {})
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Discovery(_)));
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
}

#[tokio::test]
async fn invalid_configuration_is_reported_first() {
    let journal = Journal::default();
    let err = Host::new(HostConfig::default())
        .with_source(source(vec![fake("a", &journal)]))
        .run_with(RecordingEngine::default(), async {})
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Config(_)));
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn plugins_see_settings_and_extensions() {
    use async_trait::async_trait;
    use trestle_core::{PluginFactory, StaticSource};
    use trestle_plugin_sdk::{Plugin, PluginContext, PluginIdentity};

    struct Region(&'static str);

    struct Probe;

    #[async_trait]
    impl Plugin for Probe {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new("a", "0.1.0")
        }

        async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
            let hostname = ctx.config().get_str("a.hostname", "missing");
            let region = ctx
                .extension::<Region>("region")
                .map(|r| r.0)
                .unwrap_or("none");
            ctx.logger()
                .info("probed", &[("hostname", hostname), ("region", region.into())]);
            Ok(())
        }
    }

    let sink = Arc::new(MemorySink::new());
    let source = StaticSource::new().with(PluginFactory::new("tests::probe", || {
        Ok(Box::new(Probe) as Box<dyn Plugin>)
    }));
    Host::new(config(false))
        .with_source(source)
        .with_log_sink(sink.clone())
        .with_extension("region", Region("eu-west"))
        .run_with(RecordingEngine::default(), async {})
        .await
        .unwrap();

    let probed = sink
        .for_namespace("a")
        .into_iter()
        .find(|r| r.message == "probed")
        .unwrap();
    assert_eq!(probed.field("hostname"), Some("alpha"));
    assert_eq!(probed.field("region"), Some("eu-west"));
}
