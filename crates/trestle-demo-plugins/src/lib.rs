// Each module ends with an `export_plugin!` invocation; linking this crate registers them.
mod farewell;
mod greeter;
mod heartbeat;

pub use farewell::Farewell;
pub use greeter::Greeter;
pub use heartbeat::Heartbeat;

use bytes::Bytes;
use http::{header, HeaderValue, Response};
use trestle_plugin_sdk::{HttpResponse, PluginContext};

pub(crate) fn text(body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(body.into());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// The path segment a plugin mounts its API under: `{plugin}.hostname` from
/// the host settings, or the plugin name.
pub(crate) fn hostname(ctx: &PluginContext) -> anyhow::Result<String> {
    let plugin = ctx.plugin_name();
    let hostname = ctx.config().get_str(&format!("{plugin}.hostname"), plugin);
    let hostname = hostname.trim_matches('/').to_string();
    if hostname.is_empty() || hostname.contains(['/', '{', '}', '*']) {
        anyhow::bail!("`{plugin}.hostname` must be a single path segment, got `{hostname}`");
    }
    Ok(hostname)
}
