use std::{any::Any, future::Future, sync::Arc};

use serde::Serialize;
use tokio::sync::watch;
use trestle_plugin_sdk::{CapabilitySurfaceBuilder, ConfigAccessor, LogSink};

use crate::{
    config::HostConfig,
    discovery::{InventorySource, PluginDescriptor, PluginSource},
    error::HostError,
    lifecycle::InstanceStatus,
    registry::PluginRegistry,
    server::{HttpEngine, HyperEngine},
};

/// What a host run ended with.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub plugins: Vec<InstanceStatus>,
    pub routes_bound: usize,
}

pub struct Host {
    config: HostConfig,
    source: Box<dyn PluginSource>,
    surface: CapabilitySurfaceBuilder,
}

impl Host {
    /// A host discovering plugins registered with `export_plugin!`.
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            source: Box::new(InventorySource),
            surface: CapabilitySurfaceBuilder::default(),
        }
    }

    pub fn with_source(mut self, source: impl PluginSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.surface = self.surface.log_sink(sink);
        self
    }

    /// Offers an additional host service to plugins under `name`.
    pub fn with_extension<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.surface = self.surface.extension(name, value);
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Discovers and orders plugins without instantiating them for real.
    pub fn plan(&self) -> Result<Vec<PluginDescriptor>, HostError> {
        let descriptors = PluginRegistry::discover(self.source.as_ref())?;
        Ok(PluginRegistry::resolve_order(&descriptors)?)
    }

    /// Serves the configured listeners until Ctrl+C.
    pub async fn run(self) -> Result<HostSummary, HostError> {
        self.config.validate().map_err(HostError::Config)?;
        let engine = HyperEngine::new(&self.config).map_err(HostError::Config)?;
        self.run_with(engine, ctrl_c()).await
    }

    /// Runs the full startup sequence against `engine` and serves until
    /// `shutdown` resolves, then deactivates every started plugin.
    pub async fn run_with<E, F>(self, mut engine: E, shutdown: F) -> Result<HostSummary, HostError>
    where
        E: HttpEngine,
        F: Future<Output = ()> + Send + 'static,
    {
        self.config.validate().map_err(HostError::Config)?;
        tracing::info!(version = crate::version(), "starting trestle host");

        let surface = self
            .surface
            .config(ConfigAccessor::new(self.config.settings.clone()))
            .build()
            .map_err(HostError::Config)?;
        let surface = Arc::new(surface);

        let descriptors = PluginRegistry::discover(self.source.as_ref())?;
        let ordered = PluginRegistry::resolve_order(&descriptors)?;
        tracing::info!(
            order = ?ordered.iter().map(PluginDescriptor::name).collect::<Vec<_>>(),
            "activation order resolved"
        );

        let mut registry = PluginRegistry::new(self.config.lifecycle_policy());
        match registry.activate(ordered, surface).await {
            Ok(()) => {}
            Err(err) if err.strict => {
                tracing::error!(error = %err, "activation failed in strict mode; shutting down");
                registry.deactivate().await;
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(
                    failed = ?err.plugins(),
                    error = %err,
                    "continuing without failed plugins"
                );
            }
        }

        let routes = registry.routes();
        let routes_bound = routes.len();
        for route in routes {
            if let Err(err) = engine.bind(route) {
                registry.deactivate().await;
                return Err(HostError::Engine(err));
            }
        }

        let (tx, rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            shutdown.await;
            tracing::info!("shutdown requested");
            let _ = tx.send(true);
        });
        let served = engine.run(rx).await;
        signal.abort();

        registry.deactivate().await;
        served.map_err(HostError::Engine)?;
        let summary = HostSummary {
            plugins: registry.statuses(),
            routes_bound,
        };
        tracing::info!(plugins = summary.plugins.len(), "trestle host stopped");
        Ok(summary)
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}
