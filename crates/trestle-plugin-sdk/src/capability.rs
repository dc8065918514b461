use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::bail;
use http::Method;

use crate::{
    logger::{LogSink, PluginLogger, TracingSink},
    routes::{Handler, RouteError, RoutePattern, RouteRegistrar, RouteRegistration},
    settings::ConfigAccessor,
};

pub const HTTP_ROUTES: &str = "http-routes";
pub const CONFIG: &str = "config";
pub const LOGGER: &str = "logger";

const BUILTIN: [&str; 3] = [CONFIG, HTTP_ROUTES, LOGGER];

type Extension = Arc<dyn Any + Send + Sync>;

/// Immutable bundle of host services, built once before any plugin is
/// instantiated and shared by reference for the life of the process.
pub struct CapabilitySurface {
    routes: RouteRegistrar,
    config: ConfigAccessor,
    sink: Arc<dyn LogSink>,
    extensions: BTreeMap<String, Extension>,
}

impl CapabilitySurface {
    pub fn builder() -> CapabilitySurfaceBuilder {
        CapabilitySurfaceBuilder::default()
    }

    /// Names of every capability on offer, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = BUILTIN
            .iter()
            .copied()
            .chain(self.extensions.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        BUILTIN.contains(&name) || self.extensions.contains_key(name)
    }

    pub fn routes(&self) -> &RouteRegistrar {
        &self.routes
    }

    pub fn config(&self) -> &ConfigAccessor {
        &self.config
    }

    pub fn logger(&self, namespace: &str) -> PluginLogger {
        PluginLogger::new(namespace, self.sink.clone())
    }

    pub fn extension<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.extensions.get(name).cloned()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for CapabilitySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySurface")
            .field("capabilities", &self.names())
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[derive(Default)]
pub struct CapabilitySurfaceBuilder {
    config: Option<ConfigAccessor>,
    sink: Option<Arc<dyn LogSink>>,
    extensions: BTreeMap<String, Extension>,
}

impl CapabilitySurfaceBuilder {
    pub fn config(mut self, config: ConfigAccessor) -> Self {
        self.config = Some(config);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn extension<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.extensions.insert(name.into(), Arc::new(value));
        self
    }

    pub fn build(self) -> anyhow::Result<CapabilitySurface> {
        if let Some(name) = self
            .extensions
            .keys()
            .find(|name| BUILTIN.contains(&name.as_str()))
        {
            bail!("capability name `{name}` is reserved by the host");
        }
        Ok(CapabilitySurface {
            routes: RouteRegistrar::new(),
            config: self.config.unwrap_or_default(),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            extensions: self.extensions,
        })
    }
}

#[derive(Debug, Default)]
struct RegistrationWindow {
    closed: AtomicBool,
    late_attempt: Mutex<Option<RouteError>>,
    conflict: Mutex<Option<RouteError>>,
}

impl RegistrationWindow {
    fn record(slot: &Mutex<Option<RouteError>>, err: &RouteError) {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| err.clone());
    }

    fn first(slot: &Mutex<Option<RouteError>>) -> Option<RouteError> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A plugin's view of the capability surface.
///
/// Carries the plugin's identity so log lines and route registrations are
/// attributable, and gates route registration to the plugin's `init` call.
#[derive(Clone)]
pub struct PluginContext {
    surface: Arc<CapabilitySurface>,
    plugin: Arc<str>,
    logger: PluginLogger,
    window: Arc<RegistrationWindow>,
}

impl PluginContext {
    /// Opens a context for `plugin` with the registration window open.
    pub fn new(surface: Arc<CapabilitySurface>, plugin: &str) -> Self {
        let logger = surface.logger(plugin);
        Self {
            surface,
            plugin: Arc::from(plugin),
            logger,
            window: Arc::new(RegistrationWindow::default()),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn surface(&self) -> &CapabilitySurface {
        &self.surface
    }

    pub fn config(&self) -> &ConfigAccessor {
        self.surface.config()
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn extension<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.surface.extension(name)
    }

    pub fn route(&self, method: Method, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        if self.window.closed.load(Ordering::Acquire) {
            let err = RouteError::LateRegistration {
                plugin: self.plugin.to_string(),
                method,
                pattern: pattern.to_string(),
            };
            RegistrationWindow::record(&self.window.late_attempt, &err);
            return Err(err);
        }
        let pattern = RoutePattern::parse(pattern)?;
        let fields = [
            ("method", method.to_string()),
            ("pattern", pattern.to_string()),
        ];
        let registered = self.surface.routes().register(RouteRegistration {
            method,
            pattern,
            handler,
            owner: self.plugin.to_string(),
        });
        if let Err(err @ RouteError::Conflict { .. }) = &registered {
            RegistrationWindow::record(&self.window.conflict, err);
        }
        registered?;
        self.logger.debug("route registered", &fields);
        Ok(())
    }

    pub fn get(&self, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post(&self, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        self.route(Method::POST, pattern, handler)
    }

    /// Ends the registration window; called by the host once `init` returns.
    pub fn close_registration(&self) {
        self.window.closed.store(true, Ordering::Release);
    }

    pub fn registration_open(&self) -> bool {
        !self.window.closed.load(Ordering::Acquire)
    }

    /// Whether the plugin tried to register a route after its window closed.
    pub fn attempted_late_registration(&self) -> bool {
        self.late_registration().is_some()
    }

    /// The first route registration attempted after the window closed.
    pub fn late_registration(&self) -> Option<RouteError> {
        RegistrationWindow::first(&self.window.late_attempt)
    }

    /// The first registration refused because another plugin owns the route,
    /// whether or not the plugin propagated the error.
    pub fn route_conflict(&self) -> Option<RouteError> {
        RegistrationWindow::first(&self.window.conflict)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin)
            .field("registration_open", &self.registration_open())
            .finish()
    }
}
