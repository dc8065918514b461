#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Response};
use tokio::sync::watch;
use trestle_core::{HttpEngine, PluginFactory, StaticSource};
use trestle_plugin_sdk::{
    handler_fn, HttpRequest, Plugin, PluginContext, PluginIdentity, RouteRegistration,
};

/// Shared, ordered record of everything the fake plugins did.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries ending in `.{hook}`, in order, with the suffix stripped.
    pub fn hook(&self, hook: &str) -> Vec<String> {
        let suffix = format!(".{hook}");
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Fault {
    None,
    InitError,
    InitPanic,
    StartError,
    StartHang,
    StopError,
    /// Registers a second route from `start`, after the window closed.
    LateRoute,
    /// Same, but swallows the rejection.
    LateRouteIgnored,
    /// Logs a route conflict from `init` and carries on.
    ConflictIgnored,
}

#[derive(Clone)]
pub struct FakeSpec {
    name: &'static str,
    deps: Vec<&'static str>,
    fault: Fault,
    routes: Vec<String>,
    journal: Journal,
}

pub fn fake(name: &'static str, journal: &Journal) -> FakeSpec {
    FakeSpec {
        name,
        deps: Vec::new(),
        fault: Fault::None,
        routes: vec![format!("/{name}")],
        journal: journal.clone(),
    }
}

impl FakeSpec {
    pub fn deps(mut self, deps: &[&'static str]) -> Self {
        self.deps = deps.to_vec();
        self
    }

    pub fn fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    pub fn routes(mut self, routes: &[&str]) -> Self {
        self.routes = routes.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn factory(self) -> PluginFactory {
        let origin = format!("tests::{}", self.name);
        PluginFactory::new(origin, move || {
            self.journal.push(format!("{}.new", self.name));
            Ok(Box::new(FakePlugin {
                spec: self.clone(),
                ctx: None,
            }) as Box<dyn Plugin>)
        })
    }
}

pub fn source(specs: Vec<FakeSpec>) -> StaticSource {
    specs
        .into_iter()
        .fold(StaticSource::new(), |source, spec| source.with(spec.factory()))
}

pub fn ok_handler(body: &'static str) -> trestle_plugin_sdk::Handler {
    handler_fn(move |_req: HttpRequest| async move { Ok(Response::new(Bytes::from_static(body.as_bytes()))) })
}

struct FakePlugin {
    spec: FakeSpec,
    ctx: Option<PluginContext>,
}

impl FakePlugin {
    fn record(&self, hook: &str) {
        self.spec.journal.push(format!("{}.{hook}", self.spec.name));
    }
}

#[async_trait]
impl Plugin for FakePlugin {
    fn identity(&self) -> PluginIdentity {
        self.spec
            .deps
            .iter()
            .fold(PluginIdentity::new(self.spec.name, "1.0.0"), |id, dep| id.depends_on(*dep))
    }

    async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        self.record("init");
        for route in &self.spec.routes {
            let registered = ctx.get(route, ok_handler(self.spec.name));
            match registered {
                Err(err) if self.spec.fault == Fault::ConflictIgnored => {
                    ctx.logger().warn("route skipped", &[("error", err.to_string())]);
                }
                other => other?,
            }
        }
        self.ctx = Some(ctx.clone());
        match self.spec.fault {
            Fault::InitError => anyhow::bail!("{} refused to initialize", self.spec.name),
            Fault::InitPanic => panic!("{} exploded during init", self.spec.name),
            _ => Ok(()),
        }
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.record("start");
        match self.spec.fault {
            Fault::StartError => anyhow::bail!("{} could not start", self.spec.name),
            Fault::StartHang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Fault::LateRoute | Fault::LateRouteIgnored => {
                let ctx = self.ctx.as_ref().expect("init stored the context");
                let late = ctx.get(&format!("/{}/late", self.spec.name), ok_handler("late"));
                if self.spec.fault == Fault::LateRoute {
                    late?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.record("stop");
        if self.spec.fault == Fault::StopError {
            anyhow::bail!("{} failed to release resources", self.spec.name);
        }
        Ok(())
    }
}

/// Engine that records bindings and returns as soon as shutdown is signalled.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    bound: Arc<Mutex<Vec<(Method, String, String)>>>,
    runs: Arc<Mutex<usize>>,
}

impl RecordingEngine {
    /// `(method, pattern, owner)` for every bound route.
    pub fn bound(&self) -> Vec<(Method, String, String)> {
        self.bound.lock().unwrap().clone()
    }

    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.bound().into_iter().map(|(_, _, o)| o).collect();
        owners.dedup();
        owners
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl HttpEngine for RecordingEngine {
    fn bind(&mut self, route: RouteRegistration) -> anyhow::Result<()> {
        self.bound.lock().unwrap().push((
            route.method.clone(),
            route.pattern.to_string(),
            route.owner.clone(),
        ));
        Ok(())
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        *self.runs.lock().unwrap() += 1;
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(())
    }
}
