use std::sync::Arc;

use trestle_core::{InventorySource, LifecyclePolicy, LifecycleState, PluginRegistry};
use trestle_plugin_sdk::CapabilitySurface;
// Linked for its plugin registrations.
use trestle_demo_plugins as _;

#[test]
fn linked_plugins_are_discovered_in_dependency_order() {
    let descriptors = PluginRegistry::discover(&InventorySource).unwrap();
    let ordered = PluginRegistry::resolve_order(&descriptors).unwrap();

    let names: Vec<&str> = ordered.iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["greeter", "farewell", "heartbeat"]);

    let origins: Vec<&str> = ordered.iter().map(|d| d.origin()).collect();
    assert_eq!(
        origins,
        vec![
            "trestle_demo_plugins::greeter::Greeter",
            "trestle_demo_plugins::farewell::Farewell",
            "trestle_demo_plugins::heartbeat::Heartbeat",
        ]
    );
    assert_eq!(ordered[1].dependencies(), ["greeter".to_string()]);
}

#[tokio::test]
async fn linked_plugins_activate_and_stop_cleanly() {
    let descriptors = PluginRegistry::discover(&InventorySource).unwrap();
    let ordered = PluginRegistry::resolve_order(&descriptors).unwrap();
    let surface = Arc::new(CapabilitySurface::builder().build().unwrap());
    let mut registry = PluginRegistry::new(LifecyclePolicy::default());

    registry.activate(ordered, surface).await.unwrap();
    assert_eq!(registry.started(), vec!["greeter", "farewell", "heartbeat"]);

    let mut patterns: Vec<String> = registry
        .routes()
        .iter()
        .map(|r| format!("{} {}", r.method, r.pattern))
        .collect();
    patterns.sort();
    assert_eq!(
        patterns,
        vec![
            "GET /farewell/api/goodbye",
            "GET /greeter/api/hello",
            "GET /heartbeat",
        ]
    );

    registry.deactivate().await;
    for name in ["greeter", "farewell", "heartbeat"] {
        assert_eq!(registry.state_of(name), Some(LifecycleState::Stopped));
    }
}
