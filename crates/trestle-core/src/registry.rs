use std::{sync::Arc, time::Duration};

use trestle_plugin_sdk::{CapabilitySurface, PluginContext, RouteRegistration};

use crate::{
    discovery::{self, PluginDescriptor, PluginSource},
    error::{ActivationError, DiscoveryError, Hook, HookError, HookFailure, ResolveError},
    isolation::{run_hook, HookCall},
    lifecycle::{InstanceStatus, LifecycleState, PluginInstance},
    resolve,
};

/// How activation reacts to per-plugin failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Abort on the first failure instead of attempting every plugin.
    pub strict: bool,
    /// Wall-clock budget for each `init`, `start` and `stop` call.
    pub hook_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            strict: false,
            hook_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns every plugin instance and drives it through its lifecycle.
#[derive(Default)]
pub struct PluginRegistry {
    policy: LifecyclePolicy,
    surface: Option<Arc<CapabilitySurface>>,
    instances: Vec<PluginInstance>,
}

impl PluginRegistry {
    pub fn new(policy: LifecyclePolicy) -> Self {
        Self {
            policy,
            surface: None,
            instances: Vec::new(),
        }
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    pub fn discover(source: &dyn PluginSource) -> Result<Vec<PluginDescriptor>, DiscoveryError> {
        discovery::discover(source)
    }

    pub fn resolve_order(
        descriptors: &[PluginDescriptor],
    ) -> Result<Vec<PluginDescriptor>, ResolveError> {
        resolve::resolve_order(descriptors)
    }

    /// Instantiates, initializes and starts each descriptor in order.
    ///
    /// Failures are contained to their instance. In best-effort mode every
    /// plugin is attempted and the failures are reported together at the
    /// end; in strict mode activation stops at the first failure and later
    /// plugins are never instantiated.
    pub async fn activate(
        &mut self,
        ordered: Vec<PluginDescriptor>,
        surface: Arc<CapabilitySurface>,
    ) -> Result<(), ActivationError> {
        self.surface = Some(surface.clone());
        let first = self.instances.len();
        for descriptor in ordered {
            if self.instances.iter().any(|i| i.name() == descriptor.name()) {
                tracing::warn!(plugin = descriptor.name(), "plugin already activated; skipping");
                continue;
            }
            self.instances.push(PluginInstance::new(descriptor));
        }

        let mut failures = Vec::new();
        for idx in first..self.instances.len() {
            if let Err(err) = self.activate_one(idx, &surface).await {
                self.contain(idx, &err, &surface);
                failures.push(err);
                if self.policy.strict {
                    tracing::error!(
                        skipped = self.instances.len() - idx - 1,
                        "strict mode: aborting activation after first failure"
                    );
                    return Err(ActivationError {
                        failures,
                        strict: true,
                    });
                }
            }
        }

        let started = self.started().len();
        tracing::info!(started, failed = failures.len(), "plugin activation complete");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ActivationError {
                failures,
                strict: false,
            })
        }
    }

    async fn activate_one(
        &mut self,
        idx: usize,
        surface: &Arc<CapabilitySurface>,
    ) -> Result<(), HookError> {
        let name = self.instances[idx].name().to_string();
        let fail = |hook: Hook| {
            let name = name.clone();
            move |cause: HookFailure| HookError::new(name, hook, cause)
        };

        let plugin = self.instances[idx]
            .descriptor()
            .instantiate()
            .map_err(fail(Hook::Instantiate))?;
        let ctx = PluginContext::new(surface.clone(), &name);
        let instance = &mut self.instances[idx];
        instance.plugin = Some(plugin);
        instance.context = Some(ctx.clone());
        instance.advance(LifecycleState::Instantiated);

        let init = self.invoke(idx, HookCall::Init(ctx.clone())).await;
        ctx.close_registration();
        if let Some(conflict) = ctx.route_conflict() {
            return Err(fail(Hook::Init)(HookFailure::RouteConflict(conflict)));
        }
        init.map_err(fail(Hook::Init))?;
        self.instances[idx].advance(LifecycleState::Initialized);

        let started = self.invoke(idx, HookCall::Start).await;
        if let Some(late) = ctx.late_registration() {
            return Err(fail(Hook::Start)(HookFailure::LateRegistration(late)));
        }
        started.map_err(fail(Hook::Start))?;
        self.instances[idx].advance(LifecycleState::Started);

        tracing::info!(
            plugin = %name,
            version = %self.instances[idx].descriptor().version(),
            routes = surface.routes().owned_by(&name).len(),
            "plugin started"
        );
        Ok(())
    }

    /// Stops every started instance in reverse activation order.
    ///
    /// Stop failures are logged through the capability surface and never
    /// propagated. Calling this again is a no-op.
    pub async fn deactivate(&mut self) {
        let Some(surface) = self.surface.clone() else {
            return;
        };
        for idx in (0..self.instances.len()).rev() {
            if self.instances[idx].state() != LifecycleState::Started {
                continue;
            }
            let name = self.instances[idx].name().to_string();
            match self.invoke(idx, HookCall::Stop).await {
                Ok(()) => {
                    let instance = &mut self.instances[idx];
                    instance.advance(LifecycleState::Stopped);
                    instance.plugin = None;
                    instance.context = None;
                    tracing::info!(plugin = %name, "plugin stopped");
                }
                Err(cause) => self.contain(idx, &HookError::new(name, Hook::Stop, cause), &surface),
            }
        }
    }

    /// Routes owned by plugins that reached `Started`, in registration order.
    pub fn routes(&self) -> Vec<RouteRegistration> {
        let Some(surface) = &self.surface else {
            return Vec::new();
        };
        let started = self.started();
        surface
            .routes()
            .snapshot()
            .into_iter()
            .filter(|route| started.contains(&route.owner.as_str()))
            .collect()
    }

    pub fn started(&self) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|i| i.state() == LifecycleState::Started)
            .map(PluginInstance::name)
            .collect()
    }

    pub fn state_of(&self, plugin: &str) -> Option<LifecycleState> {
        self.instances
            .iter()
            .find(|i| i.name() == plugin)
            .map(PluginInstance::state)
    }

    /// Snapshot of every instance in activation order.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.instances.iter().map(PluginInstance::status).collect()
    }

    /// Runs one hook on the instance at `idx` under the policy's budget.
    /// The plugin is put back only if the hook ran to completion.
    async fn invoke(&mut self, idx: usize, call: HookCall) -> Result<(), HookFailure> {
        let instance = &mut self.instances[idx];
        let Some(plugin) = instance.plugin.take() else {
            return Err(HookFailure::Cancelled);
        };
        tracing::debug!(plugin = instance.name(), hook = %call.hook(), "invoking hook");
        let (plugin, result) = run_hook(plugin, call, self.policy.hook_timeout).await;
        self.instances[idx].plugin = plugin;
        result
    }

    /// Moves a failed instance to `Failed`, withdraws its routes and emits
    /// one structured log line naming the plugin, hook and cause.
    fn contain(&mut self, idx: usize, err: &HookError, surface: &CapabilitySurface) {
        let instance = &mut self.instances[idx];
        instance.fail(err.cause.to_string());
        let withdrawn = surface.routes().withdraw(&err.plugin);
        metrics::counter!("trestle_plugin_failures_total", "hook" => err.hook.as_str()).increment(1);
        surface.logger(&err.plugin).error(
            "plugin lifecycle hook failed",
            &[
                ("hook", err.hook.to_string()),
                ("cause", err.cause.to_string()),
                ("timeout", err.is_timeout().to_string()),
                ("withdrawn_routes", withdrawn.to_string()),
            ],
        );
    }
}
