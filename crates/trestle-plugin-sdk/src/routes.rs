use std::{
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use http::{Method, Request, Response};
use tower::util::{service_fn, BoxCloneSyncService};

pub type HttpRequest = Request<Bytes>;
pub type HttpResponse = Response<Bytes>;

/// Type-erased request handler contributed by a plugin.
///
/// Handlers are cloned per request by the engine and must tolerate being
/// invoked concurrently.
pub type Handler = BoxCloneSyncService<HttpRequest, HttpResponse, anyhow::Error>;

/// Wraps an async function into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(HttpRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HttpResponse>> + Send + 'static,
{
    BoxCloneSyncService::new(service_fn(f))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error(
        "route {method} {pattern} from `{new_owner}` conflicts with the same route registered by `{existing_owner}`"
    )]
    Conflict {
        method: Method,
        pattern: String,
        existing_owner: String,
        new_owner: String,
    },
    #[error("plugin `{plugin}` tried to register {method} {pattern} after init returned")]
    LateRegistration {
        plugin: String,
        method: Method,
        pattern: String,
    },
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Capture(String),
    /// Matches the remaining zero or more path segments.
    Wildcard,
}

/// A parsed path pattern such as `/users/{id}/files/*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    normalized: String,
    shape: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };
        if !raw.starts_with('/') {
            return Err(invalid("pattern must start with `/`"));
        }

        let parts: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let segment = if *part == "*" {
                if idx + 1 != parts.len() {
                    return Err(invalid("`*` is only allowed as the last segment"));
                }
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty()
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(invalid("capture names must be non-empty [A-Za-z0-9_]"));
                }
                if segments
                    .iter()
                    .any(|s| matches!(s, Segment::Capture(existing) if existing == name))
                {
                    return Err(invalid("capture names must be unique"));
                }
                Segment::Capture(name.to_string())
            } else if part.contains(['{', '}', '*']) {
                return Err(invalid("literal segments must not contain `{`, `}` or `*`"));
            } else {
                Segment::Literal((*part).to_string())
            };
            segments.push(segment);
        }

        let render = |erase: bool| {
            let body = segments
                .iter()
                .map(|segment| match segment {
                    Segment::Literal(lit) => lit.clone(),
                    Segment::Capture(_) if erase => "{}".to_string(),
                    Segment::Capture(name) => format!("{{{name}}}"),
                    Segment::Wildcard => "*".to_string(),
                })
                .collect::<Vec<_>>()
                .join("/");
            format!("/{body}")
        };

        Ok(Self {
            normalized: render(false),
            shape: render(true),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Pattern with capture names erased; two patterns with the same shape
    /// match exactly the same paths.
    pub fn shape(&self) -> &str {
        &self.shape
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let mut parts = path.split('/').filter(|part| !part.is_empty()).peekable();
        let mut params = PathParams::default();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if parts.next()? != lit {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    params.push(name, parts.next()?);
                }
                Segment::Wildcard => {
                    let rest = parts.by_ref().collect::<Vec<_>>().join("/");
                    params.push("*", &rest);
                    return Some(params);
                }
            }
        }
        if parts.peek().is_some() {
            return None;
        }
        Some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

/// Values captured from the request path, available to handlers as a
/// request extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Remainder matched by a trailing `*`.
    pub fn tail(&self) -> Option<&str> {
        self.get("*")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }
}

#[derive(Clone)]
pub struct RouteRegistration {
    pub method: Method,
    pub pattern: RoutePattern,
    pub handler: Handler,
    pub owner: String,
}

impl fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Append-only, conflict-checked sequence of route registrations.
#[derive(Default)]
pub struct RouteRegistrar {
    routes: Mutex<Vec<RouteRegistration>>,
}

impl RouteRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: RouteRegistration) -> Result<(), RouteError> {
        let mut routes = self.lock();
        if let Some(existing) = routes.iter().find(|route| {
            route.method == registration.method
                && route.pattern.shape() == registration.pattern.shape()
        }) {
            return Err(RouteError::Conflict {
                method: registration.method,
                pattern: registration.pattern.as_str().to_string(),
                existing_owner: existing.owner.clone(),
                new_owner: registration.owner,
            });
        }
        routes.push(registration);
        Ok(())
    }

    /// Removes every route owned by `owner`, returning how many were dropped.
    pub fn withdraw(&self, owner: &str) -> usize {
        let mut routes = self.lock();
        let before = routes.len();
        routes.retain(|route| route.owner != owner);
        before - routes.len()
    }

    /// Registrations in the order they were accepted.
    pub fn snapshot(&self) -> Vec<RouteRegistration> {
        self.lock().clone()
    }

    pub fn owned_by(&self, owner: &str) -> Vec<RouteRegistration> {
        self.lock()
            .iter()
            .filter(|route| route.owner == owner)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RouteRegistration>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
