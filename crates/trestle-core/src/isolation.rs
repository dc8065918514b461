use std::time::Duration;

use trestle_plugin_sdk::{Plugin, PluginContext};

use crate::error::{panic_message, Hook, HookFailure};

pub(crate) enum HookCall {
    Init(PluginContext),
    Start,
    Stop,
}

impl HookCall {
    pub(crate) fn hook(&self) -> Hook {
        match self {
            HookCall::Init(_) => Hook::Init,
            HookCall::Start => Hook::Start,
            HookCall::Stop => Hook::Stop,
        }
    }
}

/// Invokes one hook within `budget`.
///
/// The plugin is handed back only when the hook ran to completion (with or
/// without an error). After a panic or timeout the instance is gone: the
/// task is aborted and whatever it owned is dropped.
pub(crate) async fn run_hook(
    plugin: Box<dyn Plugin>,
    call: HookCall,
    budget: Duration,
) -> (Option<Box<dyn Plugin>>, Result<(), HookFailure>) {
    let mut handle = tokio::spawn(invoke(plugin, call));
    match tokio::time::timeout(budget, &mut handle).await {
        Err(_) => {
            handle.abort();
            (None, Err(HookFailure::TimedOut(budget)))
        }
        Ok(Err(join_err)) if join_err.is_panic() => (
            None,
            Err(HookFailure::Panicked(panic_message(join_err.into_panic()))),
        ),
        Ok(Err(_)) => (None, Err(HookFailure::Cancelled)),
        Ok(Ok((plugin, result))) => (Some(plugin), result.map_err(HookFailure::Failed)),
    }
}

async fn invoke(mut plugin: Box<dyn Plugin>, call: HookCall) -> (Box<dyn Plugin>, anyhow::Result<()>) {
    let result = match &call {
        HookCall::Init(ctx) => plugin.init(ctx).await,
        HookCall::Start => plugin.start().await,
        HookCall::Stop => plugin.stop().await,
    };
    (plugin, result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use trestle_plugin_sdk::{CapabilitySurface, PluginIdentity};

    use super::*;

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    struct Probe(Behaviour);

    #[async_trait]
    impl Plugin for Probe {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new("probe", "0.1.0")
        }

        async fn init(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            match self.0 {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("port already in use"),
                Behaviour::Panic => panic!("start exploded"),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    const BUDGET: Duration = Duration::from_millis(100);

    async fn start(behaviour: Behaviour) -> (Option<Box<dyn Plugin>>, Result<(), HookFailure>) {
        run_hook(Box::new(Probe(behaviour)), HookCall::Start, BUDGET).await
    }

    #[tokio::test]
    async fn completed_hooks_return_the_plugin() {
        let (plugin, result) = start(Behaviour::Succeed).await;
        assert!(plugin.is_some());
        assert!(result.is_ok());

        let (plugin, result) = start(Behaviour::Fail).await;
        assert!(plugin.is_some());
        assert!(matches!(result, Err(HookFailure::Failed(ref e)) if e.to_string() == "port already in use"));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let (plugin, result) = start(Behaviour::Panic).await;
        assert!(plugin.is_none());
        assert!(matches!(result, Err(HookFailure::Panicked(ref msg)) if msg == "start exploded"));
    }

    #[tokio::test]
    async fn overruns_time_out() {
        let (plugin, result) = start(Behaviour::Hang).await;
        assert!(plugin.is_none());
        assert!(matches!(result, Err(HookFailure::TimedOut(d)) if d == BUDGET));
    }

    #[tokio::test]
    async fn init_receives_the_context() {
        let surface = Arc::new(CapabilitySurface::builder().build().unwrap());
        let ctx = PluginContext::new(surface, "probe");
        let call = HookCall::Init(ctx);
        assert_eq!(call.hook(), Hook::Init);
        let (plugin, result) = run_hook(Box::new(Probe(Behaviour::Succeed)), call, BUDGET).await;
        assert!(plugin.is_some() && result.is_ok());
    }
}
