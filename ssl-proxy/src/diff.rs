//! Diff between the last-applied servers and a fresh desired list.
//!
//! Both functions are pure, keep the order of the list they filter, and
//! build one domain-keyed map from the other side.

use std::collections::{HashMap, HashSet};

use crate::model::Server;

/// Servers in `current` that are new or whose content differs from `previous`.
pub fn select_changed_servers(previous: &[Server], current: &[Server]) -> Vec<Server> {
    let previous_by_domain: HashMap<&str, &Server> = previous
        .iter()
        .map(|server| (server.domain.as_str(), server))
        .collect();

    current
        .iter()
        .filter(|server| match previous_by_domain.get(server.domain.as_str()) {
            Some(old) => *old != *server,
            None => true,
        })
        .cloned()
        .collect()
}

/// Servers in `previous` whose domain no longer appears in `current`.
pub fn select_removed_servers(previous: &[Server], current: &[Server]) -> Vec<Server> {
    let current_domains: HashSet<&str> = current.iter().map(|s| s.domain.as_str()).collect();

    previous
        .iter()
        .filter(|server| !current_domains.contains(server.domain.as_str()))
        .cloned()
        .collect()
}
