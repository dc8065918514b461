use std::fmt;

use serde::Serialize;
use trestle_plugin_sdk::{Plugin, PluginContext};

use crate::discovery::PluginDescriptor;

/// `Discovered → Instantiated → Initialized → Started → Stopped`, with
/// `Failed` reachable from any non-terminal state. Both `Stopped` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Discovered,
    Instantiated,
    Initialized,
    Started,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Discovered, Instantiated)
            | (Instantiated, Initialized)
            | (Initialized, Started)
            | (Started, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::Instantiated => "instantiated",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Read-only snapshot of an instance, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub version: String,
    pub state: LifecycleState,
    pub failure: Option<String>,
}

/// A live plugin paired with its state and the descriptor it came from.
pub(crate) struct PluginInstance {
    descriptor: PluginDescriptor,
    state: LifecycleState,
    pub(crate) plugin: Option<Box<dyn Plugin>>,
    pub(crate) context: Option<PluginContext>,
    failure: Option<String>,
}

impl PluginInstance {
    pub(crate) fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            state: LifecycleState::Discovered,
            plugin: None,
            context: None,
            failure: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub(crate) fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    /// Moves to `next` if the state machine allows it.
    pub(crate) fn advance(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                plugin = self.name(),
                from = %self.state,
                to = %next,
                "rejected illegal lifecycle transition"
            );
            return false;
        }
        tracing::trace!(plugin = self.name(), from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        true
    }

    /// Marks the instance failed and releases the plugin object.
    pub(crate) fn fail(&mut self, cause: String) {
        if self.advance(LifecycleState::Failed) {
            self.failure = Some(cause);
        }
        self.plugin = None;
        self.context = None;
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.name().to_string(),
            version: self.descriptor.version().to_string(),
            state: self.state,
            failure: self.failure.clone(),
        }
    }
}
