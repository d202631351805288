//! Health check HTTP server
//!
//! Exposes connection status and metrics of a running client for operators
//! and container orchestration probes.

use crate::error::sanitize_error_message;
use crate::observability::metrics::ClientMetrics;
use crate::realtime::connection::{ConnectionState, ConnectionStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// No inbound frame for this long while connected is reported as stale
const ACTIVITY_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server for one client
pub struct HealthServer {
    endpoint: String,
    port: u16,
    status: watch::Receiver<ConnectionStatus>,
    metrics: Arc<ClientMetrics>,
}

impl HealthServer {
    pub fn new(
        endpoint: &str,
        port: u16,
        status: watch::Receiver<ConnectionStatus>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            endpoint: sanitize_error_message(endpoint),
            port,
            status,
            metrics,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        // GET /health - overall status, 503 unless connected
        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server(self.clone()))
            .map(|server: Arc<HealthServer>| {
                let report = server.health_report();
                let code = if report.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&report), code)
            });

        // GET /ready - readiness probe
        let ready = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server(self.clone()))
            .map(|server: Arc<HealthServer>| {
                let ready = server.current_status().is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - liveness probe
        let live = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /status - connection status only
        let status = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server(self.clone()))
            .map(|server: Arc<HealthServer>| {
                let current = server.current_status();
                warp::reply::json(&StatusResponse {
                    endpoint: server.endpoint.clone(),
                    state: current.state,
                    attempt: current.attempt,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics - counters snapshot
        let metrics = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server(self.clone()))
            .map(|server: Arc<HealthServer>| warp::reply::json(&server.metrics.snapshot()));

        // GET / - endpoint index
        let root = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Overall health with individual checks"),
                ("/ready", "Readiness probe, 200 only while connected"),
                ("/live", "Liveness probe"),
                ("/status", "Connection state and attempt counter"),
                ("/metrics", "Connection, traffic and dispatch counters"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health.or(ready).or(live).or(status).or(metrics).or(root)
    }

    /// Serve until the task is dropped or aborted
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn health_report(&self) -> HealthReport {
        let now = current_timestamp();
        let current = self.current_status();
        let snapshot = self.metrics.snapshot();

        let mut checks = BTreeMap::new();
        checks.insert("connection", connection_check(current, now));
        checks.insert(
            "activity",
            activity_check(current.state, snapshot.traffic.last_activity, now),
        );

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthReport {
            status: if healthy { "healthy" } else { "degraded" },
            timestamp: now,
            endpoint: self.endpoint.clone(),
            uptime_seconds: snapshot.uptime_seconds,
            checks,
        }
    }
}

fn with_server(
    server: Arc<HealthServer>,
) -> impl Filter<Extract = (Arc<HealthServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn connection_check(status: ConnectionStatus, now: u64) -> HealthCheck {
    let (healthy, message) = match status.state {
        ConnectionState::Connected => (true, "Connected to event stream".to_string()),
        ConnectionState::Reconnecting => (
            false,
            format!("Reconnecting after {} failed attempt(s)", status.attempt),
        ),
        ConnectionState::Failed => (
            false,
            "Reconnection attempts exhausted, manual connect required".to_string(),
        ),
        other => (false, format!("Not connected ({other})")),
    };
    HealthCheck {
        status: if healthy { "healthy" } else { "unhealthy" },
        message,
        last_check: now,
    }
}

fn activity_check(state: ConnectionState, last_activity: Option<u64>, now: u64) -> HealthCheck {
    match (state, last_activity) {
        (ConnectionState::Connected, Some(last))
            if now.saturating_sub(last) > ACTIVITY_STALENESS_THRESHOLD_SECONDS =>
        {
            HealthCheck {
                status: "stale",
                message: format!("No inbound frames for {} seconds", now.saturating_sub(last)),
                last_check: now,
            }
        }
        (_, None) => HealthCheck {
            status: "healthy",
            message: "No frames received yet".to_string(),
            last_check: now,
        },
        _ => HealthCheck {
            status: "healthy",
            message: "Recent inbound activity".to_string(),
            last_check: now,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub message: String,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    timestamp: u64,
    endpoint: String,
    uptime_seconds: u64,
    checks: BTreeMap<&'static str, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    endpoint: String,
    state: ConnectionState,
    attempt: u32,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn server(
        status: ConnectionStatus,
    ) -> (Arc<HealthServer>, watch::Sender<ConnectionStatus>, Arc<ClientMetrics>) {
        let (tx, rx) = watch::channel(status);
        let metrics = Arc::new(ClientMetrics::new());
        let server = Arc::new(HealthServer::new(
            "ws://localhost:8000/ws/risk-stream?token=abc",
            8080,
            rx,
            metrics.clone(),
        ));
        (server, tx, metrics)
    }

    #[tokio::test]
    async fn test_health_is_503_until_connected() {
        let (server, tx, _metrics) = server(ConnectionStatus::default());
        let routes = server.routes();

        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(ConnectionStatus::new(ConnectionState::Connected, 0));
        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["checks"]["connection"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_follows_connection_state() {
        let (server, _tx, _metrics) =
            server(ConnectionStatus::new(ConnectionState::Reconnecting, 2));
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let (server, _tx, _metrics) = server(ConnectionStatus::new(ConnectionState::Failed, 10));
        let response = warp::test::request()
            .path("/live")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_attempt_and_redacts_endpoint() {
        let (server, _tx, _metrics) =
            server(ConnectionStatus::new(ConnectionState::Reconnecting, 3));
        let response = warp::test::request()
            .path("/status")
            .reply(&server.routes())
            .await;

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["state"], "Reconnecting");
        assert_eq!(body["attempt"], 3);
        assert!(!body["endpoint"].as_str().unwrap().contains("abc"));
    }

    #[tokio::test]
    async fn test_metrics_route_serves_snapshot() {
        let (server, _tx, metrics) = server(ConnectionStatus::default());
        metrics.connection_attempt();
        metrics.event_dispatched(3, 0);

        let response = warp::test::request()
            .path("/metrics")
            .reply(&server.routes())
            .await;
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["connection"]["attempts"], 1);
        assert_eq!(body["dispatch"]["deliveries"], 3);
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let (server, _tx, _metrics) = server(ConnectionStatus::default());
        let response = warp::test::request().path("/").reply(&server.routes()).await;

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        for path in ["/health", "/ready", "/live", "/status", "/metrics"] {
            assert!(body["endpoints"].get(path).is_some(), "missing {path}");
        }
    }

    #[test]
    fn test_activity_check_flags_silent_connection() {
        let now = 10_000;
        let check = activity_check(ConnectionState::Connected, Some(now - 600), now);
        assert_eq!(check.status, "stale");

        let check = activity_check(ConnectionState::Connected, Some(now - 5), now);
        assert_eq!(check.status, "healthy");

        let check = activity_check(ConnectionState::Reconnecting, Some(now - 600), now);
        assert_eq!(check.status, "healthy");
    }
}
