pub mod capability;
pub mod logger;
pub mod plugin;
pub mod routes;
pub mod settings;
pub mod spa;

pub use capability::{CapabilitySurface, CapabilitySurfaceBuilder, PluginContext};
pub use logger::{LogLevel, LogRecord, LogSink, MemorySink, PluginLogger, TracingSink};
pub use plugin::{
    registrations, IdentityError, Plugin, PluginFactoryFn, PluginIdentity, PluginRegistration,
};
pub use routes::{
    handler_fn, Handler, HttpRequest, HttpResponse, PathParams, RouteError, RoutePattern,
    RouteRegistrar, RouteRegistration, Segment,
};
pub use settings::{ConfigAccessor, ConfigSource};
pub use spa::SinglePageApp;

#[doc(hidden)]
pub use anyhow;
#[doc(hidden)]
pub use inventory;

pub use async_trait::async_trait;
