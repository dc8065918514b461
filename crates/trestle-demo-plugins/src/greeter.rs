use std::sync::Arc;

use async_trait::async_trait;
use trestle_plugin_sdk::{
    export_plugin, handler_fn, HttpRequest, Plugin, PluginContext, PluginIdentity, SinglePageApp,
};

use crate::{hostname, text};

/// Answers `GET /{hostname}/api/hello` and optionally serves a single-page
/// app from `greeter.app_dir` under `/{hostname}/app`.
#[derive(Debug, Default)]
pub struct Greeter {
    hostname: String,
}

#[async_trait]
impl Plugin for Greeter {
    fn identity(&self) -> PluginIdentity {
        PluginIdentity::new("greeter", env!("CARGO_PKG_VERSION"))
            .with_description("says hello under /{hostname}/api/hello")
    }

    async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        self.hostname = hostname(ctx)?;
        let name = ctx.config().get_str("greeter.name", "greeter");
        let greeting: Arc<str> = Arc::from(format!("Hello from {name}!"));
        ctx.get(
            &format!("/{}/api/hello", self.hostname),
            handler_fn(move |_req: HttpRequest| {
                let greeting = greeting.clone();
                async move { Ok(text(greeting.to_string())) }
            }),
        )?;

        if let Some(dir) = ctx.config().get("greeter.app_dir") {
            let dir = dir
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("`greeter.app_dir` must be a string"))?
                .to_string();
            SinglePageApp::new(&dir)
                .ignore_files(|path| path.rsplit('/').next().is_some_and(|f| f.starts_with('.')))
                .mount(ctx, &format!("/{}/app", self.hostname))?;
            ctx.logger().info("serving app", &[("dir", dir)]);
        }

        ctx.logger()
            .info("greeter ready", &[("hostname", self.hostname.clone())]);
        Ok(())
    }
}

export_plugin!(Greeter);
