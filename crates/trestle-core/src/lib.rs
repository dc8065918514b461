pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
mod isolation;
pub mod lifecycle;
pub mod registry;
pub mod resolve;
pub mod router;
pub mod server;

pub use config::HostConfig;
pub use discovery::{InventorySource, PluginDescriptor, PluginFactory, PluginSource, StaticSource};
pub use error::{
    ActivationError, DiscoveryError, Hook, HookError, HookFailure, HostError, ResolveError,
    EXIT_ACTIVATION_FAILURE, EXIT_OK, EXIT_STARTUP_FAILURE,
};
pub use host::{Host, HostSummary};
pub use lifecycle::{InstanceStatus, LifecycleState};
pub use registry::{LifecyclePolicy, PluginRegistry};
pub use server::{HttpEngine, HyperEngine};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
