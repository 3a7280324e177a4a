use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
    Router,
};
use dashmap::DashMap;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allowlist::AllowList;
use crate::backend::BackendRegistry;
use crate::config::{BackendSetConfig, Config};
use crate::deploy::{CutoverSupervisor, DeploymentStatus, TrafficSplit};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::origin::OriginAdapter;
use crate::router::PathRouter;

/// An in-progress or completed shift from a blue set to its green
/// replacement.
struct SplitState {
    green_id: String,
    split: Arc<TrafficSplit>,
}

/// The single public entry point: owns the allow-list, the route table with
/// its priority counter, and the dispatch path to origin adapters.
pub struct GatewayFront {
    config: Arc<Config>,
    allowlist: AllowList,
    router: PathRouter,
    backends: BackendRegistry,
    adapter: OriginAdapter,
    splits: DashMap<String, SplitState>,
}

impl GatewayFront {
    pub fn new(config: Arc<Config>) -> GatewayResult<Self> {
        let allowlist = AllowList::new(&config.gateway.allowed_cidrs)?;
        if allowlist.is_empty() {
            warn!("Allow-list is empty; every source address will be denied");
        }
        Ok(Self {
            allowlist,
            router: PathRouter::new(config.gateway.max_patterns_per_rule),
            backends: BackendRegistry::new(),
            adapter: OriginAdapter::new()?,
            splits: DashMap::new(),
            config,
        })
    }

    /// Build the gateway and attach every configured backend set and route.
    ///
    /// A set whose dependencies are not ready is skipped with an error; it
    /// blocks only itself, the remaining sets and routes still come up.
    pub async fn from_config(config: Arc<Config>) -> GatewayResult<Arc<Self>> {
        let gateway = Arc::new(Self::new(config.clone())?);

        for (id, set_config) in &config.backend_sets {
            match gateway.backends.register(id, set_config).await {
                Ok(set) => {
                    debug!("Backend set '{}' attached ({} members)", id, set.members.len())
                }
                Err(e) => error!("Backend set '{}' not registered: {}", id, e),
            }
        }

        // Route order in the file determines priority order.
        for route in &config.routes {
            gateway
                .add_route(&route.patterns, &route.backend_set, route.strip_prefix)
                .await?;
        }

        Ok(gateway)
    }

    pub fn url(&self) -> String {
        self.config.public_url()
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Register a pattern list for a backend set; chunking and priority
    /// assignment happen in the router.
    pub async fn add_route(
        &self,
        patterns: &[String],
        backend_set: &str,
        strip_prefix: bool,
    ) -> GatewayResult<Vec<u32>> {
        let priorities = self
            .router
            .add_route(patterns, backend_set, strip_prefix)
            .await?;
        Ok(priorities)
    }

    /// Start a supervised blue/green cutover. The green set goes through
    /// dependency gates and health warmup before any traffic shifts. A
    /// rolled-back cutover leaves no trace: the split entry is dropped and
    /// the failed green set is deregistered.
    pub async fn begin_cutover(
        self: &Arc<Self>,
        blue_id: &str,
        green_id: &str,
        green_config: &BackendSetConfig,
    ) -> GatewayResult<JoinHandle<DeploymentStatus>> {
        let blue = self
            .backends
            .get(blue_id)
            .ok_or_else(|| GatewayError::UnknownBackendSet(blue_id.to_string()))?;
        let green = self.backends.register(green_id, green_config).await?;

        let split = Arc::new(TrafficSplit::new());
        self.splits.insert(
            blue_id.to_string(),
            SplitState {
                green_id: green_id.to_string(),
                split: split.clone(),
            },
        );

        let supervisor =
            CutoverSupervisor::start(blue, green, split, self.config.cutover.clone());
        let gateway = self.clone();
        let blue_id = blue_id.to_string();
        let green_id = green_id.to_string();
        Ok(tokio::spawn(async move {
            let status = match supervisor.await {
                Ok(status) => status,
                Err(e) => DeploymentStatus::Failed {
                    reason: format!("cutover supervisor aborted: {}", e),
                },
            };
            if matches!(status, DeploymentStatus::Failed { .. }) {
                gateway.splits.remove(&blue_id);
                if let Err(e) = gateway.backends.remove(&green_id).await {
                    warn!("Failed to deregister '{}' after rollback: {}", green_id, e);
                }
            }
            status
        }))
    }

    /// Resolve the set a request actually lands on. Completed cutovers
    /// chain (blue replaced by green, green later replaced in turn), so
    /// splits are followed transitively; the hop count is bounded by the
    /// number of split entries.
    fn effective_backend(&self, routed: &str) -> String {
        let mut current = routed.to_string();
        for _ in 0..=self.splits.len() {
            let next = match self.splits.get(&current) {
                Some(state) if state.split.route_to_green() => state.green_id.clone(),
                _ => return current,
            };
            current = next;
        }
        current
    }

    /// Full dispatch path: allow-list, route match, member selection,
    /// origin forward. Every rejection is a fixed response.
    pub async fn dispatch(&self, req: Request, client_ip: IpAddr) -> GatewayResult<Response> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(|q| q.to_string());

        // Denied traffic never reaches route evaluation.
        if !self.allowlist.permits(client_ip) {
            warn!("Denied request {} from {} to {}", request_id, client_ip, path);
            return Err(GatewayError::SourceDenied(client_ip.to_string()));
        }

        let route = self
            .router
            .find_route(&path)
            .await
            .ok_or_else(|| GatewayError::NoRoute(path.clone()))?;

        let set_id = self.effective_backend(&route.backend_set);
        let set = self
            .backends
            .get(&set_id)
            .ok_or_else(|| GatewayError::UnknownBackendSet(set_id.clone()))?;
        let member = set
            .select_member()
            .ok_or_else(|| GatewayError::NoHealthyMember(set_id.clone()))?;

        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| GatewayError::BadRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        member.connection_started();
        let result = self
            .adapter
            .forward(
                &set.origin,
                &member.url,
                &method,
                &parts.headers,
                &route.forward_path,
                query.as_deref(),
                body_bytes,
                client_ip,
                &request_id,
            )
            .await;
        member.connection_finished();

        match &result {
            Ok(response) => info!(
                "Request {} completed: {} {} -> {} ({}ms) [{}]",
                request_id,
                method,
                path,
                response.status().as_u16(),
                start_time.elapsed().as_millis(),
                member.url
            ),
            Err(e) => error!("Request {} failed against {}: {}", request_id, member.url, e),
        }
        result
    }

    /// Run the public listener until the task is cancelled.
    pub async fn serve(self: Arc<Self>) -> GatewayResult<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let app = Router::new()
            .fallback(handle_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
                    .into_inner(),
            )
            .with_state(self.clone());

        let listener = TcpListener::bind(&addr).await?;
        info!("Gateway front listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

async fn handle_request(
    State(gateway): State<Arc<GatewayFront>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match gateway.dispatch(req, addr.ip()).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
