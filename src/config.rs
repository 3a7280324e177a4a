use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub backend_sets: HashMap<String, BackendSetConfig>,
    pub routes: Vec<RouteEntryConfig>,
    #[serde(default)]
    pub cutover: CutoverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// CIDR ranges allowed to reach the gateway. Empty list denies everything.
    pub allowed_cidrs: Vec<String>,

    /// Optional custom domain; must be paired with hosted_zone_id.
    pub custom_domain: Option<String>,

    /// Hosted zone identifier for the custom domain.
    pub hosted_zone_id: Option<String>,

    /// Provider-specific cap on patterns per routing rule. Pattern lists
    /// longer than this are split into separate rules with fresh priorities.
    #[serde(default = "default_max_patterns_per_rule")]
    pub max_patterns_per_rule: usize,
}

fn default_max_patterns_per_rule() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSetConfig {
    pub members: Vec<MemberConfig>,
    pub origin: OriginConfig,
    pub health_check: HealthCheckConfig,
    /// Readiness probes that must pass, in order, before this set is
    /// registered. A failed probe blocks this set only.
    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemberConfig {
    pub url: String,
}

/// Origin kinds are a closed set; the adapter matches on the tag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OriginConfig {
    /// Service-discovery name plus container port.
    Container { service: String, port: u16 },
    /// Serverless invocation URL; sign_payloads enables the content-hash
    /// header handshake.
    Serverless {
        url: String,
        #[serde(default)]
        sign_payloads: bool,
        /// The wrapping runtime re-injects its own authorization header, so
        /// the incoming value is relocated to a sidecar header.
        #[serde(default)]
        relocate_authorization: bool,
    },
    /// Fixed URL target.
    Static { url: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_serde", default = "default_health_interval")]
    pub interval: Duration,
    #[serde(with = "duration_serde", default = "default_health_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(with = "duration_serde", default = "default_deregistration_delay")]
    pub deregistration_delay: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    6
}

fn default_deregistration_delay() -> Duration {
    Duration::from_secs(10)
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            deregistration_delay: default_deregistration_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencyConfig {
    pub name: String,
    /// URL probed for readiness (any response counts as reachable).
    pub url: String,
    #[serde(with = "duration_serde", default = "default_dependency_wait")]
    pub max_wait: Duration,
}

fn default_dependency_wait() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteEntryConfig {
    /// Path patterns: exact literals, trailing-wildcard (`/v1/*`), or
    /// greedy-path syntax (`/v1/{proxy+}`). Both wildcard spellings are
    /// normalized at registration.
    pub patterns: Vec<String>,
    pub backend_set: String,
    /// Strip the matched prefix so the backend sees paths relative to its
    /// own root.
    #[serde(default)]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CutoverConfig {
    /// Share of traffic moved to green per step, in percent.
    #[serde(default = "default_shift_percent")]
    pub shift_percent: u8,
    /// How long each step's share is sustained before the next shift.
    #[serde(with = "duration_serde", default = "default_step_duration")]
    pub step_duration: Duration,
    /// Overall deadline; the cutover rolls back and reports failure when hit.
    #[serde(with = "duration_serde", default = "default_cutover_timeout")]
    pub timeout: Duration,
}

fn default_shift_percent() -> u8 {
    10
}

fn default_step_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_cutover_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            shift_percent: default_shift_percent(),
            step_duration: default_step_duration(),
            timeout: default_cutover_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    /// Verbose request logging. Logging is read-only: it must never touch
    /// the forwarded payload.
    #[serde(default)]
    pub debug: bool,
}

impl LoggingConfig {
    /// Default tracing filter when no environment override is present. The
    /// CLI verbose flag and the config debug flag both force debug.
    pub fn filter_directive(&self, verbose: bool) -> String {
        if verbose || self.debug {
            return "debug".to_string();
        }
        self.level.clone().unwrap_or_else(|| "info".to_string())
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Fatal at load time; nothing starts on error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        // Exactly one of {custom domain, hosted zone} is a misconfiguration.
        if self.gateway.custom_domain.is_some() != self.gateway.hosted_zone_id.is_some() {
            anyhow::bail!(
                "You have to set both hosted_zone_id and custom_domain! Or leave both blank."
            );
        }

        if self.gateway.max_patterns_per_rule == 0 {
            anyhow::bail!("max_patterns_per_rule cannot be zero");
        }

        for cidr in &self.gateway.allowed_cidrs {
            cidr.parse::<ipnet::IpNet>()
                .with_context(|| format!("Invalid CIDR in allowed_cidrs: {}", cidr))?;
        }

        for (name, set) in &self.backend_sets {
            if set.members.is_empty() {
                anyhow::bail!("Backend set '{}' must have at least one member", name);
            }
            for member in &set.members {
                if member.url.is_empty() {
                    anyhow::bail!("Member URL cannot be empty in backend set '{}'", name);
                }
            }
            if set.health_check.healthy_threshold == 0 || set.health_check.unhealthy_threshold == 0
            {
                anyhow::bail!("Health thresholds cannot be zero in backend set '{}'", name);
            }
        }

        for route in &self.routes {
            if route.patterns.is_empty() {
                anyhow::bail!("Route for '{}' has no patterns", route.backend_set);
            }
            if !self.backend_sets.contains_key(&route.backend_set) {
                anyhow::bail!("Route references unknown backend set: {}", route.backend_set);
            }
        }

        if self.cutover.shift_percent == 0 || self.cutover.shift_percent > 100 {
            anyhow::bail!("cutover.shift_percent must be within 1..=100");
        }

        Ok(())
    }

    /// Public URL of the gateway front.
    pub fn public_url(&self) -> String {
        match &self.gateway.custom_domain {
            Some(domain) => format!("https://{}", domain),
            None => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        serializer.serialize_str(&format!("{}s", secs))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if s.ends_with("ms") {
            let num: u64 = s.trim_end_matches("ms").parse()?;
            Ok(Duration::from_millis(num))
        } else if s.ends_with('s') {
            let num: u64 = s.trim_end_matches('s').parse()?;
            Ok(Duration::from_secs(num))
        } else if s.ends_with('m') {
            let num: u64 = s.trim_end_matches('m').parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if s.ends_with('h') {
            let num: u64 = s.trim_end_matches('h').parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }
}
