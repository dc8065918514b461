use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use trestle_plugin_sdk::{registrations, Plugin, PluginIdentity, PluginRegistration};

use crate::error::{panic_message, DiscoveryError, HookFailure};

type CreateFn = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// A way to construct a plugin, tagged with where it came from.
#[derive(Clone)]
pub struct PluginFactory {
    origin: String,
    create: CreateFn,
}

impl PluginFactory {
    pub fn new<F>(origin: impl Into<String>, create: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Self {
            origin: origin.into(),
            create: Arc::new(create),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Runs the factory, containing both errors and panics.
    pub fn instantiate(&self) -> Result<Box<dyn Plugin>, HookFailure> {
        match catch_unwind(AssertUnwindSafe(|| (self.create)())) {
            Ok(Ok(plugin)) => Ok(plugin),
            Ok(Err(err)) => Err(HookFailure::Failed(err)),
            Err(payload) => Err(HookFailure::Panicked(panic_message(payload))),
        }
    }
}

impl From<&'static PluginRegistration> for PluginFactory {
    fn from(registration: &'static PluginRegistration) -> Self {
        let create = registration.factory();
        Self::new(registration.origin(), move || create())
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// The host's service-discovery facility.
pub trait PluginSource: Send + Sync {
    fn factories(&self) -> Vec<PluginFactory>;
}

/// Plugins registered at link time through `export_plugin!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InventorySource;

impl PluginSource for InventorySource {
    fn factories(&self) -> Vec<PluginFactory> {
        registrations().map(PluginFactory::from).collect()
    }
}

/// An explicit list of factories.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    factories: Vec<PluginFactory>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: PluginFactory) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn push(&mut self, factory: PluginFactory) {
        self.factories.push(factory);
    }
}

impl PluginSource for StaticSource {
    fn factories(&self) -> Vec<PluginFactory> {
        self.factories.clone()
    }
}

/// Immutable description of one discovered plugin.
#[derive(Clone)]
pub struct PluginDescriptor {
    identity: PluginIdentity,
    version: semver::Version,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    pub fn dependencies(&self) -> &[String] {
        &self.identity.dependencies
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn origin(&self) -> &str {
        self.factory.origin()
    }

    pub fn instantiate(&self) -> Result<Box<dyn Plugin>, HookFailure> {
        self.factory.instantiate()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.identity.name)
            .field("version", &self.version.to_string())
            .field("dependencies", &self.identity.dependencies)
            .field("origin", &self.factory.origin)
            .finish()
    }
}

/// Enumerates `source` once and introspects each plugin it offers.
///
/// Each factory is run once to read the plugin's identity; that probe
/// instance is dropped again. Descriptors come back sorted by name.
pub fn discover(source: &dyn PluginSource) -> Result<Vec<PluginDescriptor>, DiscoveryError> {
    let mut found: BTreeMap<String, PluginDescriptor> = BTreeMap::new();
    for factory in source.factories() {
        let identity = introspect(&factory)?;
        let version = identity
            .validate()
            .map_err(|source| DiscoveryError::InvalidIdentity {
                origin: factory.origin().to_string(),
                source,
            })?;

        if let Some(existing) = found.get(&identity.name) {
            return Err(DiscoveryError::Duplicate {
                name: identity.name.clone(),
                first_origin: existing.origin().to_string(),
                second_origin: factory.origin().to_string(),
            });
        }

        tracing::debug!(
            plugin = %identity.name,
            version = %version,
            origin = factory.origin(),
            dependencies = ?identity.dependencies,
            "discovered plugin"
        );
        found.insert(
            identity.name.clone(),
            PluginDescriptor {
                identity,
                version,
                factory,
            },
        );
    }
    tracing::info!(count = found.len(), "plugin discovery complete");
    Ok(found.into_values().collect())
}

fn introspect(factory: &PluginFactory) -> Result<PluginIdentity, DiscoveryError> {
    let instantiate_failed = |reason: String| DiscoveryError::Instantiate {
        origin: factory.origin().to_string(),
        reason,
    };
    let probe = factory
        .instantiate()
        .map_err(|failure| instantiate_failed(failure.to_string()))?;
    catch_unwind(AssertUnwindSafe(|| probe.identity()))
        .map_err(|payload| instantiate_failed(format!("identity() panicked: {}", panic_message(payload))))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use trestle_plugin_sdk::PluginContext;

    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Plugin for Named {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new(self.0, self.1)
        }

        async fn init(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn named(origin: &str, name: &'static str, version: &'static str) -> PluginFactory {
        PluginFactory::new(origin, move || Ok(Box::new(Named(name, version)) as Box<dyn Plugin>))
    }

    #[test]
    fn descriptors_are_sorted_by_name() {
        let source = StaticSource::new()
            .with(named("crate_b", "beta", "1.0.0"))
            .with(named("crate_a", "alpha", "0.3.1"));
        let found = discover(&source).unwrap();
        let names: Vec<_> = found.iter().map(PluginDescriptor::name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(found[0].version(), &semver::Version::new(0, 3, 1));
        assert_eq!(found[0].origin(), "crate_a");
    }

    #[test]
    fn duplicate_identities_name_both_origins() {
        let source = StaticSource::new()
            .with(named("first", "alpha", "1.0.0"))
            .with(named("second", "alpha", "2.0.0"));
        match discover(&source) {
            Err(DiscoveryError::Duplicate {
                name,
                first_origin,
                second_origin,
            }) => {
                assert_eq!(name, "alpha");
                assert_eq!(first_origin, "first");
                assert_eq!(second_origin, "second");
            }
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn failing_factories_abort_discovery() {
        let source = StaticSource::new().with(PluginFactory::new("broken", || {
            anyhow::bail!("no default constructor")
        }));
        let err = discover(&source).unwrap_err();
        assert!(matches!(err, DiscoveryError::Instantiate { ref origin, .. } if origin == "broken"));
        assert!(err.to_string().contains("no default constructor"));
    }

    #[test]
    fn panicking_factories_are_contained() {
        let source = StaticSource::new().with(PluginFactory::new("explodes", || -> anyhow::Result<Box<dyn Plugin>> {
            panic!("kaboom")
        }));
        let err = discover(&source).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn malformed_versions_are_rejected() {
        let source = StaticSource::new().with(named("bad", "alpha", "latest"));
        assert!(matches!(
            discover(&source),
            Err(DiscoveryError::InvalidIdentity { .. })
        ));
    }
}
