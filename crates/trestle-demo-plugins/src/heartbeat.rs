use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::oneshot, task::JoinHandle};
use trestle_plugin_sdk::{
    export_plugin, handler_fn, HttpRequest, Plugin, PluginContext, PluginIdentity, PluginLogger,
};

use crate::text;

/// Counts beats on a background task between `start` and `stop`, and
/// reports them at `GET /heartbeat`.
#[derive(Default)]
pub struct Heartbeat {
    interval: Duration,
    beats: Arc<AtomicU64>,
    logger: Option<PluginLogger>,
    ticker: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

#[async_trait]
impl Plugin for Heartbeat {
    fn identity(&self) -> PluginIdentity {
        PluginIdentity::new("heartbeat", env!("CARGO_PKG_VERSION"))
            .with_description("background ticker exposing a beat counter")
    }

    async fn init(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        let interval_ms = ctx.config().get_u64("heartbeat.interval_ms", 30_000);
        if interval_ms == 0 {
            anyhow::bail!("`heartbeat.interval_ms` must be greater than zero");
        }
        self.interval = Duration::from_millis(interval_ms);
        self.logger = Some(ctx.logger().clone());

        let beats = self.beats.clone();
        ctx.get(
            "/heartbeat",
            handler_fn(move |_req: HttpRequest| {
                let beats = beats.load(Ordering::Relaxed);
                async move { Ok(text(format!("beats={beats}"))) }
            }),
        )?;
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let beats = self.beats.clone();
        let logger = self.logger.clone();
        let mut ticker = tokio::time::interval(self.interval);
        let handle = tokio::spawn(async move {
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
                        if let Some(logger) = &logger {
                            logger.debug("beat", &[("count", n.to_string())]);
                        }
                    }
                }
            }
        });
        self.ticker = Some((stop_tx, handle));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some((stop_tx, handle)) = self.ticker.take() {
            let _ = stop_tx.send(());
            handle.await?;
        }
        Ok(())
    }
}

export_plugin!(Heartbeat);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn beats_between_start_and_stop() {
        let surface = testing::surface(json!({ "heartbeat": { "interval_ms": 10 } }));
        let ctx = PluginContext::new(surface.clone(), "heartbeat");
        let mut plugin = Heartbeat::default();
        plugin.init(&ctx).await.unwrap();
        plugin.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        plugin.stop().await.unwrap();

        let counted = plugin.beats.load(Ordering::Relaxed);
        assert!(counted > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(plugin.beats.load(Ordering::Relaxed), counted);

        let response = testing::get(&surface, "/heartbeat").await.unwrap();
        assert_eq!(response.body(), format!("beats={counted}").as_str());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let surface = testing::surface(json!({ "heartbeat": { "interval_ms": 0 } }));
        let ctx = PluginContext::new(surface, "heartbeat");
        assert!(Heartbeat::default().init(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        Heartbeat::default().stop().await.unwrap();
    }
}
