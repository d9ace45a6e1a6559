use std::sync::Arc;

use crate::gateway::ObjectStoreGateway;
use crate::observability::MetricsRegistry;
use crate::orchestrator::Orchestrator;
use crate::persist::repo::AuditRepo;
use crate::pipeline::Pipeline;
use crate::ingress::auth::OidcProvider;
use crate::sync::{SyncMetrics, WorkspaceRegistry};

/// Application state passed to ingress handlers via Axum's `State`
/// extractor. Everything here is wired once at startup in [`crate::run`]
/// and shared across every tenant/conversation.
#[derive(Clone)]
pub struct AppState {
	pub pipeline: Arc<Pipeline>,
	pub orchestrator: Arc<Orchestrator>,
	pub gateway: Arc<dyn ObjectStoreGateway>,
	pub workspace_registry: Arc<WorkspaceRegistry>,
	pub audit_repo: Arc<dyn AuditRepo>,
	pub metrics: Arc<MetricsRegistry>,
	pub sync_metrics: Arc<SyncMetrics>,
	pub oidc: Option<Arc<OidcProvider>>,
	pub object_size_cap_bytes: u64,
}
