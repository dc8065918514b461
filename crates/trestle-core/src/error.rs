use std::{any::Any, fmt, time::Duration};

use trestle_plugin_sdk::{IdentityError, RouteError};

/// Process exit code for a normal shutdown.
pub const EXIT_OK: u8 = 0;
/// Process exit code for configuration, discovery or resolution failures.
pub const EXIT_STARTUP_FAILURE: u8 = 1;
/// Process exit code for an activation failure in strict mode.
pub const EXIT_ACTIVATION_FAILURE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("plugin from `{origin}` could not be instantiated for introspection: {reason}")]
    Instantiate { origin: String, reason: String },
    #[error("plugin from `{origin}` reports a malformed identity: {source}")]
    InvalidIdentity {
        origin: String,
        #[source]
        source: IdentityError,
    },
    #[error("plugin `{name}` is registered twice (`{first_origin}` and `{second_origin}`)")]
    Duplicate {
        name: String,
        first_origin: String,
        second_origin: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("cyclic plugin dependency between {}", .members.join(", "))]
    CyclicDependency { members: Vec<String> },
    #[error("plugin `{plugin}` depends on `{missing}`, which was not discovered")]
    UnresolvedDependency { plugin: String, missing: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Instantiate,
    Init,
    Start,
    Stop,
}

impl Hook {
    pub const fn as_str(self) -> &'static str {
        match self {
            Hook::Instantiate => "instantiate",
            Hook::Init => "init",
            Hook::Start => "start",
            Hook::Stop => "stop",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single hook invocation did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum HookFailure {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    LateRegistration(RouteError),
    #[error(transparent)]
    RouteConflict(RouteError),
    #[error("hook task was cancelled")]
    Cancelled,
}

/// A contained, per-instance lifecycle failure.
#[derive(Debug, thiserror::Error)]
#[error("{hook} hook of plugin `{plugin}` failed: {cause}")]
pub struct HookError {
    pub plugin: String,
    pub hook: Hook,
    #[source]
    pub cause: HookFailure,
}

impl HookError {
    pub fn new(plugin: impl Into<String>, hook: Hook, cause: HookFailure) -> Self {
        Self {
            plugin: plugin.into(),
            hook,
            cause,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, HookFailure::TimedOut(_))
    }
}

/// Every failure collected while activating plugins. In strict mode it holds
/// exactly the first failure.
#[derive(Debug)]
pub struct ActivationError {
    pub failures: Vec<HookError>,
    pub strict: bool,
}

impl ActivationError {
    pub fn plugins(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.plugin.as_str()).collect()
    }
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.strict { "strict" } else { "best-effort" };
        write!(
            f,
            "{} plugin(s) failed to activate ({mode}): ",
            self.failures.len()
        )?;
        for (idx, failure) in self.failures.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ActivationError {}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error("http engine failed: {0:#}")]
    Engine(anyhow::Error),
}

impl HostError {
    pub fn exit_code(&self) -> u8 {
        match self {
            HostError::Activation(_) => EXIT_ACTIVATION_FAILURE,
            HostError::Config(_)
            | HostError::Discovery(_)
            | HostError::Resolve(_)
            | HostError::Engine(_) => EXIT_STARTUP_FAILURE,
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
