use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use http::{header, Response, StatusCode};

use crate::{
    capability::PluginContext,
    routes::{handler_fn, Handler, HttpRequest, HttpResponse, PathParams, RouteError},
};

type IgnoreFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Static hosting for a single-page application under `{prefix}/*`.
///
/// A directory serves its own default page if it has one. Any other path
/// that does not resolve to a file gets the root default page so client-side
/// routing keeps working. Ignored files and paths escaping the root answer
/// `403 Forbidden`.
#[derive(Clone)]
pub struct SinglePageApp {
    root: PathBuf,
    default_page: String,
    ignored: Vec<IgnoreFn>,
}

impl SinglePageApp {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_page: "index.html".into(),
            ignored: Vec::new(),
        }
    }

    pub fn default_page(mut self, page: impl Into<String>) -> Self {
        self.default_page = page.into();
        self
    }

    /// Requests for paths matching `predicate` are answered with `403`.
    pub fn ignore_files(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.ignored.push(Arc::new(predicate));
        self
    }

    /// Registers `GET {prefix}/*` on behalf of the calling plugin.
    pub fn mount(self, ctx: &PluginContext, prefix: &str) -> Result<(), RouteError> {
        let pattern = format!("{}/*", prefix.trim_end_matches('/'));
        ctx.get(&pattern, self.into_handler())
    }

    pub fn into_handler(self) -> Handler {
        let app = Arc::new(self);
        handler_fn(move |req: HttpRequest| {
            let app = app.clone();
            async move {
                let tail = req
                    .extensions()
                    .get::<PathParams>()
                    .and_then(PathParams::tail)
                    .unwrap_or_default()
                    .to_string();
                app.serve(&tail).await
            }
        })
    }

    async fn serve(&self, tail: &str) -> anyhow::Result<HttpResponse> {
        let Some(relative) = sanitize(tail) else {
            return Ok(status(StatusCode::FORBIDDEN));
        };
        if self.ignored.iter().any(|ignored| ignored(tail)) {
            return Ok(status(StatusCode::FORBIDDEN));
        }

        let mut candidate = self.root.join(&relative);
        if is_dir(&candidate).await {
            candidate.push(&self.default_page);
        }
        let path = if is_file(&candidate).await {
            candidate
        } else {
            self.root.join(&self.default_page)
        };

        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type(&path))
                .body(Bytes::from(contents))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(status(StatusCode::NOT_FOUND)),
            Err(err) => Err(err.into()),
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|meta| meta.is_file())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|meta| meta.is_dir())
}

/// Turns a request tail into a relative path, refusing anything that could
/// leave the root directory.
fn sanitize(tail: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(tail).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn status(code: StatusCode) -> HttpResponse {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = code;
    response
}
