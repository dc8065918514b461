use std::collections::{BTreeMap, BTreeSet};

use crate::{discovery::PluginDescriptor, error::ResolveError};

/// Orders descriptors so that every dependency precedes its dependents.
///
/// Among plugins that are ready at the same time, names are taken in
/// ascending lexical order, so the result is fully deterministic.
pub fn resolve_order(
    descriptors: &[PluginDescriptor],
) -> Result<Vec<PluginDescriptor>, ResolveError> {
    let graph: BTreeMap<&str, Vec<&str>> = descriptors
        .iter()
        .map(|d| {
            (
                d.name(),
                d.dependencies().iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let order = topological_order(&graph)?;
    let by_name: BTreeMap<&str, &PluginDescriptor> =
        descriptors.iter().map(|d| (d.name(), d)).collect();
    Ok(order
        .iter()
        .filter_map(|name| by_name.get(name.as_str()).map(|d| (*d).clone()))
        .collect())
}

/// Kahn's algorithm over `plugin -> dependencies` edges.
pub(crate) fn topological_order(
    graph: &BTreeMap<&str, Vec<&str>>,
) -> Result<Vec<String>, ResolveError> {
    for (plugin, deps) in graph {
        if let Some(missing) = deps.iter().find(|dep| !graph.contains_key(*dep)) {
            return Err(ResolveError::UnresolvedDependency {
                plugin: (*plugin).to_string(),
                missing: (*missing).to_string(),
            });
        }
    }

    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (plugin, deps) in graph {
        let unique: BTreeSet<&str> = deps.iter().copied().collect();
        pending.insert(*plugin, unique.len());
        for dep in unique {
            dependents.entry(dep).or_default().push(*plugin);
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < graph.len() {
        let stuck: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| *name)
            .collect();
        let members = stuck
            .iter()
            .filter(|node| on_cycle(graph, &stuck, **node))
            .map(|node| (*node).to_string())
            .collect();
        return Err(ResolveError::CyclicDependency { members });
    }
    Ok(order)
}

/// Whether `start` can reach itself through dependencies inside `stuck`.
/// Plugins that merely depend on a cycle are not part of it.
fn on_cycle(graph: &BTreeMap<&str, Vec<&str>>, stuck: &BTreeSet<&str>, start: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = neighbours(graph, stuck, start);
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if seen.insert(node) {
            stack.extend(neighbours(graph, stuck, node));
        }
    }
    false
}

fn neighbours<'a>(
    graph: &BTreeMap<&'a str, Vec<&'a str>>,
    stuck: &BTreeSet<&'a str>,
    node: &str,
) -> Vec<&'a str> {
    graph
        .get(node)
        .into_iter()
        .flatten()
        .copied()
        .filter(|dep| stuck.contains(dep))
        .collect()
}
