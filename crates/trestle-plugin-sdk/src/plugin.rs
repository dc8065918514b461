use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::PluginContext;

/// Identity a plugin reports about itself during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub version: String,
    /// Plugins that must reach `Started` before this one is activated.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("plugin name must not be empty")]
    EmptyName,
    #[error(
        "plugin name `{0}` must contain only lowercase alphanumerics and hyphens, and must not start or end with a hyphen"
    )]
    InvalidName(String),
    #[error("plugin `{name}` declares an invalid version `{version}`: {source}")]
    InvalidVersion {
        name: String,
        version: String,
        #[source]
        source: semver::Error,
    },
}

impl PluginIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            description: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.requires(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn requires(&self, plugin: &str) -> bool {
        self.dependencies.iter().any(|d| d == plugin)
    }

    /// Checks the name format and returns the parsed version.
    pub fn validate(&self) -> Result<semver::Version, IdentityError> {
        if self.name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        let well_formed = self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.name.starts_with('-')
            && !self.name.ends_with('-');
        if !well_formed {
            return Err(IdentityError::InvalidName(self.name.clone()));
        }
        semver::Version::parse(&self.version).map_err(|source| IdentityError::InvalidVersion {
            name: self.name.clone(),
            version: self.version.clone(),
            source,
        })
    }
}

/// Contract implemented by every plugin.
///
/// The registry drives each instance through `init`, `start` and, at
/// shutdown, `stop`. Routes may only be registered from `init`. `start`
/// must return promptly; ongoing work belongs on a spawned task.
#[async_trait]
pub trait Plugin: Send + 'static {
    fn identity(&self) -> PluginIdentity;

    async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()>;

    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type PluginFactoryFn = fn() -> anyhow::Result<Box<dyn Plugin>>;

/// Link-time registration collected by the host's discovery step.
/// Created through [`export_plugin!`](crate::export_plugin).
pub struct PluginRegistration {
    origin: &'static str,
    create: PluginFactoryFn,
}

impl PluginRegistration {
    pub const fn new(origin: &'static str, create: PluginFactoryFn) -> Self {
        Self { origin, create }
    }

    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub fn factory(&self) -> PluginFactoryFn {
        self.create
    }
}

inventory::collect!(PluginRegistration);

/// Every plugin registered with [`export_plugin!`](crate::export_plugin) in
/// the linked binary.
pub fn registrations() -> impl Iterator<Item = &'static PluginRegistration> {
    inventory::iter::<PluginRegistration>.into_iter()
}

/// Registers a plugin type with the host.
///
/// ```ignore
/// export_plugin!(Greeter);                 // uses Default
/// export_plugin!(Greeter, Greeter::new);   // explicit constructor
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        $crate::export_plugin!($plugin, <$plugin as ::core::default::Default>::default);
    };
    ($plugin:ty, $ctor:expr) => {
        const _: () = {
            fn __trestle_create(
            ) -> $crate::anyhow::Result<::std::boxed::Box<dyn $crate::Plugin>> {
                let plugin: ::std::boxed::Box<dyn $crate::Plugin> =
                    ::std::boxed::Box::new(($ctor)());
                ::std::result::Result::Ok(plugin)
            }
            $crate::inventory::submit! {
                $crate::PluginRegistration::new(
                    ::core::concat!(::core::module_path!(), "::", ::core::stringify!($plugin)),
                    __trestle_create,
                )
            }
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_deduplicates_dependencies() {
        let identity = PluginIdentity::new("farewell", "0.2.0")
            .depends_on("greeter")
            .depends_on("greeter")
            .with_description("says goodbye");
        assert_eq!(identity.dependencies, vec!["greeter".to_string()]);
        assert!(identity.requires("greeter"));
        assert_eq!(identity.validate().unwrap(), semver::Version::new(0, 2, 0));
    }

    #[test]
    fn malformed_identities_are_rejected() {
        assert!(matches!(
            PluginIdentity::new("", "1.0.0").validate(),
            Err(IdentityError::EmptyName)
        ));
        for name in ["Greeter", "-lead", "trail-", "has space", "under_score"] {
            assert!(matches!(
                PluginIdentity::new(name, "1.0.0").validate(),
                Err(IdentityError::InvalidName(_))
            ));
        }
        assert!(matches!(
            PluginIdentity::new("ok", "one").validate(),
            Err(IdentityError::InvalidVersion { .. })
        ));
    }
}
