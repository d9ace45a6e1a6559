use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::state::AppState;

/// DB health endpoint: returns 200 OK when the audit repository can run a
/// simple query, otherwise 503 Service Unavailable.
pub async fn db_health(State(state): State<AppState>) -> impl IntoResponse {
	match state.audit_repo.ping().await {
		Ok(()) => (StatusCode::OK, "OK").into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("db error: {}", e)).into_response(),
	}
}

/// Liveness endpoint: always 200 once the process is serving requests;
/// reports the number of active containers as a coarse sanity signal.
pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
	let active = state.orchestrator.active_count();
	(StatusCode::OK, format!("OK active_containers={active}"))
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::gateway::local_fs::LocalFsGateway;
	use crate::ingress::auth::OidcProvider;
	use crate::observability::MetricsRegistry;
	use crate::orchestrator::{ContainerPolicy, NoopContainerRuntime, Orchestrator};
	use crate::persist::repo::AuditRepo;
	use crate::persist::repo::test_double::InMemoryAuditRepo;
	use crate::pipeline::{MockAgentClient, Pipeline};
	use crate::sync::{SyncEngine, SyncMetrics, WorkspaceRegistry};
	use std::sync::Arc;
	use std::time::Duration;
	use tempfile::tempdir;

	async fn test_state(audit_repo: Arc<dyn AuditRepo>) -> AppState {
		let dir = tempdir().unwrap();
		let gateway: Arc<dyn crate::gateway::ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(dir.path(), "workspaces", 10 * 1024 * 1024));
		let orchestrator = Arc::new(Orchestrator::new(
			Arc::new(NoopContainerRuntime::new()),
			ContainerPolicy {
				network_mode: "none",
				readonly_rootfs: true,
				tmpfs_size: "64m".to_string(),
				storage_size: "256m".to_string(),
				memory: "512m".to_string(),
				cpu_quota: "1".to_string(),
				pids_limit: 64,
				cap_drop: "ALL",
				no_new_privileges: true,
				seccomp_profile: None,
				apparmor_profile: None,
				userns_remap: false,
			},
			"agent-sandbox:test",
			dir.path().to_path_buf(),
			std::env::temp_dir().join("agent-substrate-health-test-sock"),
			2,
			Duration::from_secs(300),
		));
		let metrics = Arc::new(MetricsRegistry::new());
		let workspace_registry = Arc::new(WorkspaceRegistry::new());
		let (persist_tx, _rx) = tokio::sync::mpsc::channel(8);
		let pipeline = Arc::new(Pipeline {
			orchestrator: orchestrator.clone(),
			sync_engine: Arc::new(SyncEngine::new(gateway.clone(), Arc::new(SyncMetrics::default()))),
			gateway: gateway.clone(),
			lock_registry: Arc::new(crate::lock_registry::ConversationLockRegistry::new()),
			workspace_registry: workspace_registry.clone(),
			agent_client: Arc::new(MockAgentClient {
				session_id: "sess".to_string(),
			}),
			persist_sender: persist_tx,
			metrics: metrics.clone(),
			run_timeout: Duration::from_secs(5),
			heartbeat_interval: Duration::from_millis(50),
			heartbeat_failure_limit: 3,
		});

		AppState {
			pipeline,
			orchestrator,
			gateway,
			workspace_registry,
			audit_repo,
			metrics,
			sync_metrics: Arc::new(SyncMetrics::default()),
			oidc: None::<Arc<OidcProvider>>,
			object_size_cap_bytes: 10 * 1024 * 1024,
		}
	}

	#[tokio::test]
	async fn health_check_returns_ok_when_db_healthy() {
		let state = test_state(Arc::new(InMemoryAuditRepo::default())).await;
		let response = db_health(State(state)).await.into_response();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn liveness_reports_zero_active_containers_when_idle() {
		let state = test_state(Arc::new(InMemoryAuditRepo::default())).await;
		let response = liveness(State(state)).await.into_response();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
