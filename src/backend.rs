use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{BackendSetConfig, DependencyConfig, HealthCheckConfig, OriginConfig};
use crate::error::{GatewayError, Result as GatewayResult};

/// Lifecycle of a backend set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Enumerated, health parameters attached, checks not yet running.
    Registering,
    /// Health checks polling; not yet eligible for traffic.
    HealthyPending,
    /// Eligible to receive routed traffic.
    InService,
    /// In-flight connections finishing within the deregistration delay.
    Draining,
    Removed,
}

/// One interchangeable instance behind a routing rule.
#[derive(Debug)]
pub struct BackendMember {
    pub url: String,
    state: RwLock<MemberState>,
    // Read by the router on every request; never blocks on an in-flight
    // health check.
    eligible: AtomicBool,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
    in_flight: AtomicUsize,
}

impl BackendMember {
    fn new(url: String) -> Self {
        Self {
            url,
            state: RwLock::new(MemberState::Registering),
            eligible: AtomicBool::new(false),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible.load(Ordering::Relaxed)
    }

    pub async fn state(&self) -> MemberState {
        *self.state.read().await
    }

    pub fn connection_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Apply one health check observation.
    ///
    /// A member must pass `healthy_threshold` consecutive checks to become
    /// eligible and is excluded after `unhealthy_threshold` consecutive
    /// failures, at which point it must pass the full threshold again.
    pub async fn record_health(&self, passed: bool, config: &HealthCheckConfig) {
        let mut state = self.state.write().await;
        match *state {
            MemberState::Draining | MemberState::Removed | MemberState::Registering => return,
            MemberState::HealthyPending | MemberState::InService => {}
        }

        if passed {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if *state == MemberState::HealthyPending && successes >= config.healthy_threshold {
                *state = MemberState::InService;
                self.eligible.store(true, Ordering::Relaxed);
                info!("Member {} entered service after {} consecutive passes", self.url, successes);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if *state == MemberState::InService && failures >= config.unhealthy_threshold {
                *state = MemberState::HealthyPending;
                self.eligible.store(false, Ordering::Relaxed);
                warn!(
                    "Member {} excluded from rotation after {} consecutive failures",
                    self.url, failures
                );
            }
        }
    }

    pub(crate) async fn begin_health_checks(&self) {
        let mut state = self.state.write().await;
        if *state == MemberState::Registering {
            *state = MemberState::HealthyPending;
        }
    }

    /// Stop receiving traffic, let in-flight connections finish for the
    /// bounded deregistration delay, then drop the member.
    pub async fn drain(&self, delay: Duration) {
        {
            let mut state = self.state.write().await;
            if *state == MemberState::Removed {
                return;
            }
            *state = MemberState::Draining;
            self.eligible.store(false, Ordering::Relaxed);
        }
        info!("Draining member {} for {:?}", self.url, delay);
        tokio::time::sleep(delay).await;
        let remaining = self.in_flight();
        if remaining > 0 {
            warn!("Member {} removed with {} connections still open", self.url, remaining);
        }
        *self.state.write().await = MemberState::Removed;
    }
}

/// A named, health-checked pool of interchangeable backend members.
///
/// Referenced by routes, not owned by them; the set's lifecycle follows its
/// originating service.
#[derive(Debug)]
pub struct BackendSet {
    pub id: String,
    pub members: Vec<Arc<BackendMember>>,
    pub origin: OriginConfig,
    pub health_check: HealthCheckConfig,
    rr_cursor: AtomicUsize,
}

impl BackendSet {
    pub fn new(id: String, config: &BackendSetConfig) -> Self {
        let members = config
            .members
            .iter()
            .map(|m| Arc::new(BackendMember::new(m.url.clone())))
            .collect();
        Self {
            id,
            members,
            origin: config.origin.clone(),
            health_check: config.health_check.clone(),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Round-robin over eligible members only.
    pub fn select_member(&self) -> Option<Arc<BackendMember>> {
        let eligible: Vec<_> = self.members.iter().filter(|m| m.is_eligible()).collect();
        if eligible.is_empty() {
            warn!("No eligible member in backend set '{}'", self.id);
            return None;
        }
        let index = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        let member = eligible[index].clone();
        debug!("Selected member {} from backend set '{}'", member.url, self.id);
        Some(member)
    }

    pub fn eligible_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_eligible()).count()
    }

    /// Drain every member in parallel and wait for all to be removed.
    pub async fn drain_all(&self) {
        let delay = self.health_check.deregistration_delay;
        let handles: Vec<_> = self
            .members
            .iter()
            .map(|member| {
                let member = member.clone();
                tokio::spawn(async move { member.drain(delay).await })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Backend set '{}' fully drained", self.id);
    }
}

/// Probe one member once. 200-299 and 307 count as healthy.
pub async fn probe_member(client: &Client, base_url: &str, config: &HealthCheckConfig) -> bool {
    let health_url = format!("{}{}", base_url.trim_end_matches('/'), config.path);
    match tokio::time::timeout(config.timeout, client.get(&health_url).send()).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            let healthy = (200..=299).contains(&status) || status == 307;
            if !healthy {
                debug!("Health check for {} returned HTTP {}", base_url, status);
            }
            healthy
        }
        Ok(Err(e)) => {
            debug!("Health check for {} failed: {}", base_url, e);
            false
        }
        Err(_) => {
            debug!("Health check for {} timed out", base_url);
            false
        }
    }
}

/// Runs an independent fixed-interval check loop per member, decoupled from
/// request handling.
pub struct HealthMonitor {
    client: Client,
}

impl HealthMonitor {
    pub fn new() -> Self {
        // 307 must be observed, not followed.
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("edge-gateway-healthcheck/1.0")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn start(&self, set: Arc<BackendSet>) {
        for member in &set.members {
            let member = member.clone();
            let client = self.client.clone();
            let config = set.health_check.clone();
            tokio::spawn(async move {
                member.begin_health_checks().await;
                let mut ticker = interval(config.interval);
                loop {
                    ticker.tick().await;
                    if member.state().await == MemberState::Removed {
                        break;
                    }
                    let passed = probe_member(&client, &member.url, &config).await;
                    member.record_health(passed, &config).await;
                }
                debug!("Health loop for {} stopped", member.url);
            });
        }
        info!(
            "Health monitoring started for backend set '{}' ({} members)",
            set.id,
            set.members.len()
        );
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for each declared dependency in order before exposing a set.
///
/// A not-ready dependency blocks only the dependent set's registration; the
/// caller keeps serving everything already registered.
pub async fn await_dependencies(client: &Client, deps: &[DependencyConfig]) -> GatewayResult<()> {
    for dep in deps {
        let deadline = tokio::time::Instant::now() + dep.max_wait;
        loop {
            // Any response means reachable; readiness, not health.
            match client.get(&dep.url).send().await {
                Ok(_) => {
                    info!("Dependency '{}' is reachable", dep.name);
                    break;
                }
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GatewayError::DependencyNotReady(format!(
                            "{} ({}) not reachable within {:?}: {}",
                            dep.name, dep.url, dep.max_wait, e
                        )));
                    }
                    debug!("Waiting for dependency '{}': {}", dep.name, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    Ok(())
}

/// All backend sets attached to the gateway front.
pub struct BackendRegistry {
    sets: DashMap<String, Arc<BackendSet>>,
    monitor: HealthMonitor,
    client: Client,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
            monitor: HealthMonitor::new(),
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Create a set, wait for its dependencies, and start health checks.
    pub async fn register(
        &self,
        id: &str,
        config: &BackendSetConfig,
    ) -> GatewayResult<Arc<BackendSet>> {
        if self.sets.contains_key(id) {
            return Err(GatewayError::BadRequest(format!(
                "Backend set '{}' already exists",
                id
            )));
        }

        await_dependencies(&self.client, &config.depends_on).await?;

        let set = Arc::new(BackendSet::new(id.to_string(), config));
        self.monitor.start(set.clone());
        self.sets.insert(id.to_string(), set.clone());
        info!("Registered backend set '{}' with {} members", id, set.members.len());
        Ok(set)
    }

    /// Register a set without a health-check warmup: every member starts
    /// in service. Used for replacement sets promoted by a cutover test
    /// harness and for static origins without a meaningful health path.
    pub fn register_in_service(&self, id: &str, config: &BackendSetConfig) -> Arc<BackendSet> {
        let set = Arc::new(BackendSet::new(id.to_string(), config));
        for member in &set.members {
            member.eligible.store(true, Ordering::Relaxed);
        }
        self.sets.insert(id.to_string(), set.clone());
        set
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackendSet>> {
        self.sets.get(id).map(|entry| entry.value().clone())
    }

    /// Drain and drop a set; called when its originating service is torn
    /// down.
    pub async fn remove(&self, id: &str) -> GatewayResult<()> {
        let set = self
            .sets
            .remove(id)
            .map(|(_, set)| set)
            .ok_or_else(|| GatewayError::UnknownBackendSet(id.to_string()))?;
        set.drain_all().await;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.sets.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberConfig;

    fn set_config(urls: &[&str]) -> BackendSetConfig {
        BackendSetConfig {
            members: urls
                .iter()
                .map(|u| MemberConfig { url: u.to_string() })
                .collect(),
            origin: OriginConfig::Static {
                url: "http://unused".to_string(),
            },
            health_check: HealthCheckConfig {
                healthy_threshold: 2,
                unhealthy_threshold: 6,
                deregistration_delay: Duration::from_millis(20),
                ..HealthCheckConfig::default()
            },
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn member_becomes_eligible_after_consecutive_passes() {
        let set = BackendSet::new("api".to_string(), &set_config(&["http://10.0.0.1:80"]));
        let member = &set.members[0];
        member.begin_health_checks().await;

        member.record_health(true, &set.health_check).await;
        assert!(!member.is_eligible());
        assert_eq!(member.state().await, MemberState::HealthyPending);

        member.record_health(true, &set.health_check).await;
        assert!(member.is_eligible());
        assert_eq!(member.state().await, MemberState::InService);
    }

    #[tokio::test]
    async fn failure_resets_the_pass_streak() {
        let set = BackendSet::new("api".to_string(), &set_config(&["http://10.0.0.1:80"]));
        let member = &set.members[0];
        member.begin_health_checks().await;

        member.record_health(true, &set.health_check).await;
        member.record_health(false, &set.health_check).await;
        member.record_health(true, &set.health_check).await;
        assert!(!member.is_eligible());

        member.record_health(true, &set.health_check).await;
        assert!(member.is_eligible());
    }

    #[tokio::test]
    async fn member_excluded_after_unhealthy_threshold() {
        // Scenario: one of two members fails six consecutive checks and is
        // excluded; traffic continues to the survivor.
        let set = BackendSet::new(
            "api".to_string(),
            &set_config(&["http://10.0.0.1:80", "http://10.0.0.2:80"]),
        );
        for member in &set.members {
            member.begin_health_checks().await;
            member.record_health(true, &set.health_check).await;
            member.record_health(true, &set.health_check).await;
        }
        assert_eq!(set.eligible_count(), 2);

        let failing = &set.members[0];
        for i in 0..6 {
            failing.record_health(false, &set.health_check).await;
            // Below the threshold the member keeps serving.
            assert_eq!(failing.is_eligible(), i < 5);
        }
        assert_eq!(set.eligible_count(), 1);

        // Every subsequent selection lands on the healthy member.
        for _ in 0..10 {
            let selected = set.select_member().unwrap();
            assert_eq!(selected.url, "http://10.0.0.2:80");
        }
    }

    #[tokio::test]
    async fn selection_round_robins_over_eligible_members() {
        let set = BackendSet::new(
            "api".to_string(),
            &set_config(&["http://a", "http://b", "http://c"]),
        );
        for member in &set.members {
            member.begin_health_checks().await;
            member.record_health(true, &set.health_check).await;
            member.record_health(true, &set.health_check).await;
        }

        let picks: Vec<String> = (0..6).map(|_| set.select_member().unwrap().url.clone()).collect();
        assert_eq!(picks[0..3], picks[3..6]);
        let mut distinct = picks[0..3].to_vec();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn empty_set_selects_nothing() {
        let set = BackendSet::new("api".to_string(), &set_config(&["http://a"]));
        assert!(set.select_member().is_none());
    }

    #[tokio::test]
    async fn drain_reaches_removed_and_blocks_traffic() {
        let set = BackendSet::new("api".to_string(), &set_config(&["http://a"]));
        let member = &set.members[0];
        member.begin_health_checks().await;
        member.record_health(true, &set.health_check).await;
        member.record_health(true, &set.health_check).await;
        assert!(member.is_eligible());

        member.drain(Duration::from_millis(10)).await;
        assert!(!member.is_eligible());
        assert_eq!(member.state().await, MemberState::Removed);

        // Health observations after removal are ignored.
        member.record_health(true, &set.health_check).await;
        member.record_health(true, &set.health_check).await;
        assert!(!member.is_eligible());
    }

    #[tokio::test]
    async fn health_probe_accepts_2xx_and_307() {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route(
                "/redirect",
                get(|| async { StatusCode::TEMPORARY_REDIRECT }),
            )
            .route(
                "/broken",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let base = format!("http://{}", addr);

        let mut config = HealthCheckConfig::default();
        config.path = "/health".to_string();
        assert!(probe_member(&client, &base, &config).await);

        config.path = "/redirect".to_string();
        assert!(probe_member(&client, &base, &config).await);

        config.path = "/broken".to_string();
        assert!(!probe_member(&client, &base, &config).await);
    }

    #[tokio::test]
    async fn unreachable_dependency_blocks_only_the_dependent_set() {
        let registry = BackendRegistry::new();

        let mut gated = set_config(&["http://10.0.0.1:80"]);
        gated.depends_on = vec![DependencyConfig {
            name: "database".to_string(),
            // TEST-NET address; nothing listens there.
            url: "http://192.0.2.1:1/ready".to_string(),
            max_wait: Duration::from_millis(50),
        }];

        let err = registry.register("gated", &gated).await.unwrap_err();
        assert!(matches!(err, GatewayError::DependencyNotReady(_)));
        assert!(registry.get("gated").is_none());

        // An independent set still registers.
        let open = set_config(&["http://10.0.0.2:80"]);
        registry.register("open", &open).await.unwrap();
        assert!(registry.get("open").is_some());
    }

    #[tokio::test]
    async fn removed_set_is_drained_and_forgotten() {
        let registry = BackendRegistry::new();
        let config = set_config(&["http://a"]);
        let set = registry.register("api", &config).await.unwrap();
        assert_eq!(registry.names(), vec!["api".to_string()]);

        registry.remove("api").await.unwrap();
        assert!(registry.get("api").is_none());
        for member in &set.members {
            assert_eq!(member.state().await, MemberState::Removed);
        }

        let err = registry.remove("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBackendSet(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = BackendRegistry::new();
        let config = set_config(&["http://a"]);
        registry.register("api", &config).await.unwrap();
        let err = registry.register("api", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }
}
