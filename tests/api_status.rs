//! Integration tests per la route di stato `GET /`

mod common;

#[cfg(test)]
mod status_tests {
    use super::common::*;
    use axum_test::TestServer;
    use metrics_ws::auth::JwtVerifier;
    use metrics_ws::core::AppState;
    use metrics_ws::ws::ConnectionRegistry;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn create_test_state() -> Arc<AppState> {
        let (_tx, config) = watch::channel(Arc::new(test_config(15)));
        Arc::new(AppState {
            registry: Arc::new(ConnectionRegistry::new()),
            verifier: Arc::new(JwtVerifier::new(TEST_SECRET)),
            source: Arc::new(StaticSource),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    #[tokio::test]
    async fn test_root_reports_status() {
        let app = metrics_ws::create_router(create_test_state());
        let server = TestServer::new(app).expect("Failed to create test server");

        let response = server.get("/").await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["broadcast_interval_secs"], 15);
        assert_eq!(body["enabled_metrics"].as_array().map(|m| m.len()), Some(3));
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = metrics_ws::create_router(create_test_state());
        let server = TestServer::new(app).expect("Failed to create test server");

        let response = server.get("/ws").await;

        assert!(response.status_code().is_client_error());
    }
}
