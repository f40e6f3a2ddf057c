//! Host-based routing for proxied requests.
//!
//! A request is routed when its host is a registered domain. Every routed
//! request goes to the same destination; only the path and query are kept.

use std::sync::Arc;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::registry::Registry;

/// Lower-case host without port or trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal: [::1]:443
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Matched route with resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute {
    /// Registered domain the request was addressed to
    pub domain: String,
    /// Absolute URL on the destination
    pub forward_url: String,
}

/// Routes registered hosts to the single destination
pub struct Router {
    registry: Arc<Registry>,
    destination: Url,
}

impl Router {
    pub fn new(registry: Arc<Registry>, destination: Url) -> Self {
        Self {
            registry,
            destination,
        }
    }

    /// `scheme://destination_domain` as a base URL
    pub fn destination_url(scheme: &str, destination_domain: &str) -> Result<Url> {
        Url::parse(&format!("{}://{}", scheme, destination_domain)).map_err(|e| {
            ProxyError::Config(format!("Invalid destination '{}': {}", destination_domain, e))
        })
    }

    pub fn destination(&self) -> &Url {
        &self.destination
    }

    /// Find the route for a request
    pub fn match_route(&self, host: &str, path_and_query: &str) -> Result<MatchedRoute> {
        let domain = normalize_host(host);
        if domain.is_empty() || !self.registry.contains_host(&domain) {
            return Err(ProxyError::NotFound(format!("host {}", domain)));
        }

        let base = self.destination.as_str().trim_end_matches('/');
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        Ok(MatchedRoute {
            domain,
            forward_url: format!("{}{}", base, path),
        })
    }
}
