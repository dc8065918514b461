use std::{
    convert::Infallible,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::{header, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::Instrument;
use trestle_plugin_sdk::{HttpResponse, RouteRegistration};

use crate::{
    config::{HostConfig, ResolvedListener, Tls},
    error::panic_message,
    router::{RouteMatch, Router},
};

/// The component that binds routes to a network endpoint and serves them.
#[async_trait]
pub trait HttpEngine: Send {
    /// Adds a route; must be called before [`run`](HttpEngine::run).
    fn bind(&mut self, route: RouteRegistration) -> Result<()>;

    /// Serves requests until `shutdown` flips to `true`, then drains.
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct RequestLimits {
    max_body_bytes: usize,
    timeout: Option<Duration>,
}

struct AppState {
    router: Router,
    limits: RequestLimits,
}

struct BoundListener {
    name: String,
    tcp: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

/// hyper-based [`HttpEngine`] serving HTTP/1.1 on every configured listener.
pub struct HyperEngine {
    listeners: Vec<ResolvedListener>,
    bound: Vec<BoundListener>,
    routes: Vec<RouteRegistration>,
    limits: RequestLimits,
    grace: Duration,
}

impl HyperEngine {
    pub fn new(config: &HostConfig) -> Result<Self> {
        Ok(Self {
            listeners: config.resolved_listeners()?,
            bound: Vec::new(),
            routes: Vec::new(),
            limits: RequestLimits {
                max_body_bytes: config.server.max_body_bytes,
                timeout: config.request_timeout(),
            },
            grace: config.shutdown_grace(),
        })
    }

    pub fn routes(&self) -> &[RouteRegistration] {
        &self.routes
    }

    /// Binds every listener socket and returns the local addresses.
    ///
    /// Optional: [`run`](HttpEngine::run) binds on its own, but calling this
    /// first surfaces bind errors early and reveals ports chosen by the OS.
    pub async fn listen(&mut self) -> Result<Vec<SocketAddr>> {
        if self.bound.is_empty() {
            for listener in &self.listeners {
                let acceptor = listener
                    .tls
                    .as_ref()
                    .map(build_tls_acceptor)
                    .transpose()
                    .with_context(|| format!("invalid tls for listener `{}`", listener.name))?;
                let tcp = TcpListener::bind(listener.addr)
                    .await
                    .with_context(|| format!("failed to bind listener `{}`", listener.name))?;
                tracing::info!(
                    listener = listener.name,
                    addr = %tcp.local_addr()?,
                    tls = acceptor.is_some(),
                    "listener ready"
                );
                self.bound.push(BoundListener {
                    name: listener.name.clone(),
                    tcp,
                    acceptor,
                });
            }
        }
        self.bound
            .iter()
            .map(|b| b.tcp.local_addr().map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl HttpEngine for HyperEngine {
    fn bind(&mut self, route: RouteRegistration) -> Result<()> {
        if let Some(existing) = self.routes.iter().find(|r| {
            r.method == route.method && r.pattern.shape() == route.pattern.shape()
        }) {
            bail!(
                "route {} {} is already bound by `{}`",
                route.method,
                route.pattern,
                existing.owner
            );
        }
        tracing::debug!(method = %route.method, pattern = %route.pattern, owner = route.owner, "route bound");
        self.routes.push(route);
        Ok(())
    }

    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.listen().await?;
        let state = Arc::new(AppState {
            router: Router::build(&self.routes)?,
            limits: self.limits,
        });

        let mut join_set = JoinSet::new();
        for listener in self.bound.drain(..) {
            join_set.spawn(serve_listener(
                listener,
                state.clone(),
                shutdown.clone(),
                self.grace,
            ));
        }
        tracing::info!(routes = state.router.len(), "http engine running");

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "listener task aborted");
            }
        }
        tracing::info!("http engine stopped");
        Ok(())
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_listener(
    listener: BoundListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let name = listener.name;
    let conn_shutdown = shutdown.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accept = listener.tcp.accept() => match accept {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        listener.acceptor.clone(),
                        state.clone(),
                        conn_shutdown.clone(),
                    ));
                    while connections.try_join_next().is_some() {}
                }
                Err(err) => {
                    tracing::warn!(listener = name, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    drop(listener.tcp);

    tracing::info!(listener = name, open = connections.len(), "listener draining");
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            listener = name,
            remaining = connections.len(),
            "shutdown grace period elapsed; aborting connections"
        );
        connections.shutdown().await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) {
    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => serve_connection(tls, state, shutdown).await,
            Err(err) => Err(anyhow!(err).context("tls handshake failed")),
        },
        None => serve_connection(stream, state, shutdown).await,
    };
    if let Err(err) = result {
        tracing::debug!(%peer, error = %format!("{err:#}"), "connection closed with error");
    }
}

async fn serve_connection<S>(
    stream: S,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(state, req).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown_requested(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await?;
        }
    }
    Ok(())
}

async fn handle_request(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let start = Instant::now();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        owner = tracing::field::Empty,
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );
    let (response, outcome) = dispatch(&state, req).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    metrics::counter!("trestle_requests_total", "outcome" => outcome).increment(1);
    response.map(Full::new)
}

async fn dispatch(state: &AppState, req: Request<Incoming>) -> (HttpResponse, &'static str) {
    let (parts, body) = req.into_parts();
    let (route, params) = match state.router.select(&parts.method, parts.uri.path()) {
        RouteMatch::Found { route, params } => (route, params),
        RouteMatch::MethodNotAllowed { allowed } => {
            return (method_not_allowed(&allowed), "method_not_allowed")
        }
        RouteMatch::NotFound => {
            return (plain(StatusCode::NOT_FOUND, "no matching route"), "miss");
        }
    };
    tracing::Span::current().record("owner", route.owner.as_str());

    let body = match Limited::new(body, state.limits.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return (
                plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
                "too_large",
            );
        }
        Err(err) => {
            tracing::debug!(error = %err, "failed to read request body");
            return (plain(StatusCode::BAD_REQUEST, "unreadable request body"), "bad_request");
        }
    };
    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(params);

    let call = AssertUnwindSafe(route.handler.clone().oneshot(req)).catch_unwind();
    let outcome = match state.limits.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(owner = route.owner, ?limit, "handler timed out");
                return (plain(StatusCode::GATEWAY_TIMEOUT, "handler timed out"), "timeout");
            }
        },
        None => call.await,
    };
    match outcome {
        Ok(Ok(response)) => (response, "hit"),
        Ok(Err(err)) => {
            tracing::error!(owner = route.owner, error = %format!("{err:#}"), "handler failed");
            (plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"), "error")
        }
        Err(payload) => {
            tracing::error!(
                owner = route.owner,
                panic = %panic_message(payload),
                "handler panicked"
            );
            (plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"), "panic")
        }
    }
}

fn plain(status: StatusCode, msg: &'static str) -> HttpResponse {
    let mut response = Response::new(Bytes::from_static(msg.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn method_not_allowed(allowed: &[Method]) -> HttpResponse {
    let mut response = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    let list = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = HeaderValue::from_str(&list) {
        response.headers_mut().insert(header::ALLOW, value);
    }
    response
}

fn build_tls_acceptor(tls: &Tls) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let data = std::fs::read(path).with_context(|| format!("failed to read cert {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    let raw =
        rustls_pemfile::certs(&mut reader).map_err(|_| anyhow!("invalid certificate data"))?;
    if raw.is_empty() {
        bail!("no certificates found in {path}");
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let data = std::fs::read(path).with_context(|| format!("failed to read key {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    while let Some(item) =
        rustls_pemfile::read_one(&mut reader).map_err(|_| anyhow!("invalid key format"))?
    {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    bail!("no usable private keys found in {path}")
}
