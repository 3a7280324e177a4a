use anyhow::{bail, Result};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A single path pattern, normalized at registration time.
///
/// Two wildcard spellings are accepted at the registration boundary: the
/// listener-style trailing wildcard (`/v1/*`) and the HTTP-API greedy-path
/// syntax (`/v1/{proxy+}`). Both normalize to `Prefix`, so the matching
/// algorithm never sees provider syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Matches the path literally.
    Exact(String),
    /// Matches `<base>/` followed by anything, wildcard included zero chars.
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || !pattern.starts_with('/') {
            bail!("Path pattern must start with '/': {:?}", pattern);
        }

        for suffix in ["/*", "/{proxy+}"] {
            if let Some(base) = pattern.strip_suffix(suffix) {
                if base.contains('*') || base.contains('{') {
                    bail!("Wildcard is only allowed as the trailing segment: {:?}", pattern);
                }
                return Ok(PathPattern::Prefix(base.to_string()));
            }
        }

        if pattern.contains('*') || pattern.contains('{') {
            bail!("Wildcard is only allowed as the trailing segment: {:?}", pattern);
        }

        Ok(PathPattern::Exact(pattern.to_string()))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(literal) => path == literal,
            PathPattern::Prefix(base) => path
                .strip_prefix(base.as_str())
                .is_some_and(|rest| rest.starts_with('/')),
        }
    }

    /// The prefix removed from the forwarded path when a route strips.
    pub fn strip_base(&self) -> &str {
        match self {
            PathPattern::Exact(literal) => literal,
            PathPattern::Prefix(base) => base,
        }
    }
}

/// One registered rule: at most `max_patterns_per_rule` patterns bound to a
/// backend set at a unique priority.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub priority: u32,
    pub patterns: Vec<PathPattern>,
    pub backend_set: String,
    pub strip_prefix: bool,
}

/// The outcome of matching a request path against the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub backend_set: String,
    pub priority: u32,
    /// Path to forward, prefix already stripped when the route asks for it.
    pub forward_path: String,
}

#[derive(Debug)]
struct RouterState {
    rules: Vec<RouteRule>,
    // Instance-scoped and monotonic; registration order determines final
    // priority order, so registration must be deterministic.
    next_priority: u32,
}

/// Ordered route table owned by the gateway front.
#[derive(Debug)]
pub struct PathRouter {
    state: RwLock<RouterState>,
    max_patterns_per_rule: usize,
}

impl PathRouter {
    pub fn new(max_patterns_per_rule: usize) -> Self {
        Self {
            state: RwLock::new(RouterState {
                rules: Vec::new(),
                next_priority: 1,
            }),
            max_patterns_per_rule,
        }
    }

    /// Register a pattern list for a backend set.
    ///
    /// The list is chunked into groups of at most `max_patterns_per_rule`;
    /// each chunk becomes one rule at the next priority. All chunks are
    /// published under a single write section, so a partially-registered
    /// call is never visible to request handling. Registering the same
    /// patterns again is not deduplicated: the repeat receives fresh, higher
    /// priorities.
    pub async fn add_route(
        &self,
        patterns: &[String],
        backend_set: &str,
        strip_prefix: bool,
    ) -> Result<Vec<u32>> {
        if patterns.is_empty() {
            bail!("Route for backend set '{}' has no patterns", backend_set);
        }

        let parsed: Vec<PathPattern> = patterns
            .iter()
            .map(|p| PathPattern::parse(p))
            .collect::<Result<_>>()?;

        let mut state = self.state.write().await;
        let mut assigned = Vec::new();
        for chunk in parsed.chunks(self.max_patterns_per_rule) {
            let priority = state.next_priority;
            state.next_priority += 1;
            state.rules.push(RouteRule {
                priority,
                patterns: chunk.to_vec(),
                backend_set: backend_set.to_string(),
                strip_prefix,
            });
            assigned.push(priority);
        }

        info!(
            "Registered {} rule(s) for backend set '{}' at priorities {:?}",
            assigned.len(),
            backend_set,
            assigned
        );
        Ok(assigned)
    }

    /// First matching rule by ascending priority wins. Rules are appended
    /// with increasing priorities, so table order is priority order.
    pub async fn find_route(&self, path: &str) -> Option<RouteMatch> {
        let state = self.state.read().await;
        for rule in &state.rules {
            if let Some(pattern) = rule.patterns.iter().find(|p| p.matches(path)) {
                let forward_path = if rule.strip_prefix {
                    let stripped = path.strip_prefix(pattern.strip_base()).unwrap_or(path);
                    if stripped.is_empty() {
                        "/".to_string()
                    } else {
                        stripped.to_string()
                    }
                } else {
                    path.to_string()
                };

                debug!(
                    "Path {} matched priority {} -> backend set '{}'",
                    path, rule.priority, rule.backend_set
                );
                return Some(RouteMatch {
                    backend_set: rule.backend_set.clone(),
                    priority: rule.priority,
                    forward_path,
                });
            }
        }
        None
    }

    pub async fn rules(&self) -> Vec<RouteRule> {
        self.state.read().await.rules.clone()
    }
}
