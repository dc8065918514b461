use std::cmp::Ordering;

use anyhow::{bail, Result};
use http::Method;
use trestle_plugin_sdk::{PathParams, RouteRegistration, Segment};

/// Immutable dispatch table built from the routes of started plugins.
///
/// When several patterns match a path the most specific one wins: segments
/// are compared left to right with literal > capture > wildcard, and a
/// longer pattern beats its own prefix unless all it adds is a trailing
/// wildcard.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<RouteHandle>,
}

#[derive(Clone)]
struct RouteHandle {
    rank: Vec<u8>,
    registration: RouteRegistration,
}

pub enum RouteMatch<'a> {
    Found {
        route: &'a RouteRegistration,
        params: PathParams,
    },
    /// The path exists but not for this method.
    MethodNotAllowed { allowed: Vec<Method> },
    NotFound,
}

impl Router {
    pub fn build(routes: &[RouteRegistration]) -> Result<Self> {
        let mut handles: Vec<RouteHandle> = Vec::with_capacity(routes.len());
        for registration in routes {
            if let Some(existing) = handles.iter().find(|h| {
                h.registration.method == registration.method
                    && h.registration.pattern.shape() == registration.pattern.shape()
            }) {
                bail!(
                    "route {} {} is bound by both `{}` and `{}`",
                    registration.method,
                    registration.pattern,
                    existing.registration.owner,
                    registration.owner
                );
            }
            handles.push(RouteHandle {
                rank: rank(registration.pattern.segments()),
                registration: registration.clone(),
            });
        }
        handles.sort_by(|a, b| specificity(&b.rank, &a.rank));
        Ok(Self { routes: handles })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn select(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let mut allowed = Vec::new();
        for handle in &self.routes {
            let Some(params) = handle.registration.pattern.matches(path) else {
                continue;
            };
            if handle.registration.method == *method {
                return RouteMatch::Found {
                    route: &handle.registration,
                    params,
                };
            }
            if !allowed.contains(&handle.registration.method) {
                allowed.push(handle.registration.method.clone());
            }
        }
        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed { allowed }
        }
    }
}

fn rank(segments: &[Segment]) -> Vec<u8> {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Literal(_) => 2,
            Segment::Capture(_) => 1,
            Segment::Wildcard => 0,
        })
        .collect()
}

fn specificity(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.cmp(y))
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| {
            let common = a.len().min(b.len());
            match (a.get(common), b.get(common)) {
                // `/app/*` matches `/app` too, but the exact route is more specific.
                (Some(0), None) => Ordering::Less,
                (None, Some(0)) => Ordering::Greater,
                _ => a.len().cmp(&b.len()),
            }
        })
}
