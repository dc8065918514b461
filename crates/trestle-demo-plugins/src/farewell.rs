use async_trait::async_trait;
use trestle_plugin_sdk::{
    export_plugin, handler_fn, HttpRequest, Plugin, PluginContext, PluginIdentity,
};

use crate::{hostname, text};

/// Answers `GET /{hostname}/api/goodbye`. Activated after the greeter.
#[derive(Debug, Default)]
pub struct Farewell;

#[async_trait]
impl Plugin for Farewell {
    fn identity(&self) -> PluginIdentity {
        PluginIdentity::new("farewell", env!("CARGO_PKG_VERSION"))
            .depends_on("greeter")
            .with_description("says goodbye under /{hostname}/api/goodbye")
    }

    async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        let hostname = hostname(ctx)?;
        let farewell = format!("Goodbye from {}!", ctx.config().get_str("farewell.name", "farewell"));
        ctx.get(
            &format!("/{hostname}/api/goodbye"),
            handler_fn(move |_req: HttpRequest| {
                let farewell = farewell.clone();
                async move { Ok(text(farewell)) }
            }),
        )?;
        Ok(())
    }
}

export_plugin!(Farewell);
