use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::BackendSet;
use crate::config::CutoverConfig;

/// Share of traffic currently sent to the green set, in percent.
///
/// Read per request without locking; written only by the cutover supervisor.
#[derive(Debug, Default)]
pub struct TrafficSplit {
    green_share: AtomicU8,
}

impl TrafficSplit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn green_share(&self) -> u8 {
        self.green_share.load(Ordering::Relaxed)
    }

    pub fn set_green_share(&self, percent: u8) {
        self.green_share.store(percent.min(100), Ordering::Relaxed);
    }

    /// Deterministic split decision for a roll in `0..100`.
    pub fn choose_green(&self, roll: u8) -> bool {
        roll < self.green_share()
    }

    /// Sampled decision used on the request path.
    pub fn route_to_green(&self) -> bool {
        let share = self.green_share();
        if share == 0 {
            return false;
        }
        if share >= 100 {
            return true;
        }
        self.choose_green(rand::thread_rng().gen_range(0..100u8))
    }
}

/// Outcome of a blue/green cutover. A rollback is a recovered condition:
/// the deployment failed, the service did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Succeeded,
    Failed { reason: String },
}

/// Supervises a time-boxed, percentage-based shift from blue to green.
///
/// Traffic moves in `shift_percent` steps, each sustained for
/// `step_duration` while the green set's health is watched. Health
/// regression or the overall timeout reverts the split to blue and reports
/// failure; the process never hangs. Blue reaches its terminal state only
/// after the shift completes and its drain finishes.
pub struct CutoverSupervisor;

impl CutoverSupervisor {
    pub fn start(
        blue: Arc<BackendSet>,
        green: Arc<BackendSet>,
        split: Arc<TrafficSplit>,
        policy: CutoverConfig,
    ) -> JoinHandle<DeploymentStatus> {
        tokio::spawn(Self::run(blue, green, split, policy))
    }

    pub async fn run(
        blue: Arc<BackendSet>,
        green: Arc<BackendSet>,
        split: Arc<TrafficSplit>,
        policy: CutoverConfig,
    ) -> DeploymentStatus {
        let shift = Self::shift_loop(blue, green.clone(), split.clone(), &policy);
        match tokio::time::timeout(policy.timeout, shift).await {
            Ok(status) => status,
            Err(_) => {
                split.set_green_share(0);
                warn!(
                    "Cutover to '{}' exceeded {:?}; reverted to blue",
                    green.id, policy.timeout
                );
                DeploymentStatus::Failed {
                    reason: format!("cutover timed out after {:?}", policy.timeout),
                }
            }
        }
    }

    async fn shift_loop(
        blue: Arc<BackendSet>,
        green: Arc<BackendSet>,
        split: Arc<TrafficSplit>,
        policy: &CutoverConfig,
    ) -> DeploymentStatus {
        let mut share = split.green_share();
        info!(
            "Starting cutover from '{}' to '{}' ({}% per {:?} step)",
            blue.id, green.id, policy.shift_percent, policy.step_duration
        );

        // A freshly registered green set is still warming up its health
        // checks; no traffic shifts until it has an eligible member. The
        // overall timeout bounds this wait.
        while green.eligible_count() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Green set '{}' is healthy; beginning shift", green.id);

        while share < 100 {
            share = share.saturating_add(policy.shift_percent).min(100);
            split.set_green_share(share);
            info!("Shifted {}% of traffic to '{}'", share, green.id);

            if let Some(reason) = Self::sustain_step(&green, policy.step_duration).await {
                split.set_green_share(0);
                warn!("Cutover to '{}' rolled back: {}", green.id, reason);
                return DeploymentStatus::Failed { reason };
            }
        }

        // Deployment confirmed; only now may blue drain to Removed.
        blue.drain_all().await;
        info!("Cutover to '{}' complete; '{}' drained", green.id, blue.id);
        DeploymentStatus::Succeeded
    }

    /// Hold the current share for one step, watching the green health
    /// signal. Returns a reason when it regresses.
    async fn sustain_step(green: &BackendSet, step: Duration) -> Option<String> {
        let poll = (step / 5).max(Duration::from_millis(5));
        let deadline = tokio::time::Instant::now() + step;
        loop {
            if green.eligible_count() == 0 {
                return Some(format!(
                    "green set '{}' has no healthy member during shift window",
                    green.id
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemberState;
    use crate::config::{BackendSetConfig, HealthCheckConfig, MemberConfig, OriginConfig};

    fn test_set(id: &str, urls: &[&str]) -> Arc<BackendSet> {
        let config = BackendSetConfig {
            members: urls
                .iter()
                .map(|u| MemberConfig { url: u.to_string() })
                .collect(),
            origin: OriginConfig::Static {
                url: "http://unused".to_string(),
            },
            health_check: HealthCheckConfig {
                healthy_threshold: 2,
                unhealthy_threshold: 2,
                deregistration_delay: Duration::from_millis(10),
                ..HealthCheckConfig::default()
            },
            depends_on: vec![],
        };
        Arc::new(BackendSet::new(id.to_string(), &config))
    }

    async fn make_healthy(set: &BackendSet) {
        for member in &set.members {
            member.begin_health_checks().await;
            member.record_health(true, &set.health_check).await;
            member.record_health(true, &set.health_check).await;
        }
    }

    fn fast_policy() -> CutoverConfig {
        CutoverConfig {
            shift_percent: 25,
            step_duration: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn split_is_deterministic_at_the_boundaries() {
        let split = TrafficSplit::new();
        assert!(!split.route_to_green());

        split.set_green_share(30);
        assert!(split.choose_green(0));
        assert!(split.choose_green(29));
        assert!(!split.choose_green(30));
        assert!(!split.choose_green(99));

        split.set_green_share(100);
        assert!(split.route_to_green());

        // Values above 100 clamp.
        split.set_green_share(200);
        assert_eq!(split.green_share(), 100);
    }

    #[tokio::test]
    async fn healthy_green_cutover_succeeds_and_drains_blue() {
        let blue = test_set("api-blue", &["http://blue-1"]);
        let green = test_set("api-green", &["http://green-1"]);
        make_healthy(&blue).await;
        make_healthy(&green).await;

        let split = Arc::new(TrafficSplit::new());
        let status =
            CutoverSupervisor::run(blue.clone(), green.clone(), split.clone(), fast_policy()).await;

        assert_eq!(status, DeploymentStatus::Succeeded);
        assert_eq!(split.green_share(), 100);
        for member in &blue.members {
            assert_eq!(member.state().await, MemberState::Removed);
            assert!(!member.is_eligible());
        }
        assert_eq!(green.eligible_count(), 1);
    }

    #[tokio::test]
    async fn green_regression_rolls_back_and_reports_failed() {
        // Scenario: the green set's health fails during the shift window.
        let blue = test_set("api-blue", &["http://blue-1"]);
        let green = test_set("api-green", &["http://green-1"]);
        make_healthy(&blue).await;
        make_healthy(&green).await;

        let split = Arc::new(TrafficSplit::new());
        let policy = CutoverConfig {
            shift_percent: 10,
            step_duration: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        };
        let handle =
            CutoverSupervisor::start(blue.clone(), green.clone(), split.clone(), policy);

        // Let the first shift land, then regress green.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(split.green_share() > 0);
        for _ in 0..2 {
            green.members[0]
                .record_health(false, &green.health_check)
                .await;
        }

        let status = handle.await.unwrap();
        assert!(matches!(status, DeploymentStatus::Failed { .. }));

        // Reverted to blue automatically; blue never drained.
        assert_eq!(split.green_share(), 0);
        assert_eq!(blue.eligible_count(), 1);
        assert_eq!(blue.members[0].state().await, MemberState::InService);
    }

    #[tokio::test]
    async fn overall_timeout_reverts_and_fails() {
        let blue = test_set("api-blue", &["http://blue-1"]);
        let green = test_set("api-green", &["http://green-1"]);
        make_healthy(&blue).await;
        make_healthy(&green).await;

        let split = Arc::new(TrafficSplit::new());
        let policy = CutoverConfig {
            shift_percent: 1,
            step_duration: Duration::from_millis(50),
            // Far too short for 100 one-percent steps.
            timeout: Duration::from_millis(120),
        };
        let status =
            CutoverSupervisor::run(blue.clone(), green, split.clone(), policy).await;

        assert!(matches!(status, DeploymentStatus::Failed { .. }));
        assert_eq!(split.green_share(), 0);
        assert_eq!(blue.eligible_count(), 1);
    }
}
