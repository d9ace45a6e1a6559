pub mod config;
pub mod devops;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod ingress;
pub mod lock_registry;
pub mod observability;
pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod proxy;
pub mod sse;
pub mod state;
pub mod sync;
pub mod tls_utils;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue};
use axum::routing::get;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::sensitive_headers::{SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::ObjectStoreGateway;
use crate::gateway::s3::{S3Credentials, S3Gateway};
use crate::ingress::auth::OidcProvider;
use crate::lock_registry::ConversationLockRegistry;
use crate::orchestrator::{ContainerPolicy, DockerContainerRuntime, Orchestrator};
use crate::persist::repo::{AuditRepo, PostgresAuditRepo};
use crate::pipeline::Pipeline;
use crate::proxy::ProxyServer;
use crate::proxy::whitelist::Whitelist;
use crate::state::AppState;
use crate::sync::{SyncEngine, SyncMetrics, WorkspaceRegistry};

/// Metrics text composing the core registry with the sync engine's own
/// atomic counters, mirroring the teacher's `persist::metrics_text()` +
/// `sync::global_sync_metrics()` composition at `GET /metrics`.
async fn metrics_text(state: axum::extract::State<AppState>) -> String {
	let mut text = state.metrics.encode();
	text.push_str(&state.sync_metrics.to_prometheus_text());
	text
}

/// Load the egress whitelist from `settings.whitelist_path`, or an
/// empty (deny-all) whitelist when unset — the fail-closed default for a
/// credential-injection proxy with nothing configured (§4.B.2).
async fn load_whitelist(settings: &config::Settings) -> anyhow::Result<Whitelist> {
	match &settings.whitelist_path {
		Some(path) => {
			let data = tokio::fs::read_to_string(path).await?;
			Whitelist::from_json(&data)
		}
		None => {
			warn!("no whitelist_path configured; credential-injection proxy is deny-all");
			Ok(Whitelist::new(vec![]))
		}
	}
}

/// Start the hardened ingress: bootstrap every component (§4), bind TLS,
/// and serve until the process is killed.
///
/// Errors are logged rather than returned so the simple `main` runner can
/// call this without changing its signature, matching the teacher's
/// `run()` shape.
pub async fn run() {
	let obs_state = match crate::observability::init_observability().await {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to initialize observability: {}", e);
			crate::observability::ObservabilityState::default()
		}
	};

	let settings = match crate::config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config: {}", e);
			return;
		}
	};

	let whitelist = match load_whitelist(&settings).await {
		Ok(w) => w,
		Err(e) => {
			eprintln!("failed to load whitelist ({}); refusing to start", e);
			return;
		}
	};

	let s3_credentials = S3Credentials {
		access_key_id: settings.s3_access_key_id.clone().unwrap_or_default(),
		secret_access_key: settings.s3_secret_access_key.clone().unwrap_or_default(),
		session_token: None,
	};
	let gateway: Arc<dyn ObjectStoreGateway> = Arc::new(S3Gateway::new(
		settings.s3_endpoint.clone().unwrap_or_default(),
		settings.s3_bucket_name.clone(),
		settings.s3_workspace_prefix.clone(),
		settings.s3_region.clone(),
		s3_credentials.clone(),
		settings.object_size_cap_bytes,
	));

	let lock_registry = Arc::new(ConversationLockRegistry::new());
	let workspace_registry = Arc::new(WorkspaceRegistry::new());
	let sync_metrics = Arc::new(SyncMetrics::default());
	let sync_engine = Arc::new(SyncEngine::new(gateway.clone(), sync_metrics.clone()));

	let max_retries: u32 = std::env::var("AGX_DB_CONNECT_RETRIES")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(60);
	let backoff_ms: u64 = std::env::var("AGX_DB_CONNECT_BACKOFF_MS")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(1000);

	let database_url = match &settings.database_url {
		Some(url) => url.clone(),
		None => {
			eprintln!("AGX_DATABASE_URL not configured; refusing to start");
			return;
		}
	};

	let mut last_err: Option<anyhow::Error> = None;
	let mut repo_opt: Option<PostgresAuditRepo> = None;
	for attempt in 1..=max_retries {
		match PostgresAuditRepo::connect(&database_url).await {
			Ok(r) => {
				repo_opt = Some(r);
				break;
			}
			Err(e) => {
				warn!("DB connect attempt {}/{} failed: {}", attempt, max_retries, e);
				last_err = Some(e);
				if attempt < max_retries {
					tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
				}
			}
		}
	}

	let repo = match repo_opt {
		Some(r) => r,
		None => {
			eprintln!(
				"failed to connect to the audit database after {} attempts: {}",
				max_retries,
				last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string())
			);
			return;
		}
	};

	if let Err(e) = repo.migrate().await {
		eprintln!("failed to apply audit ledger schema: {}", e);
		return;
	}

	let audit_repo: Arc<dyn AuditRepo> = Arc::new(repo);

	let persist_sender = crate::persist::start_batcher(
		audit_repo.clone(),
		obs_state.metrics.clone(),
		10_000,
		100,
		1_000,
	);

	let proxy_audit_tx = crate::proxy::audit::start_audit_sink(audit_repo.clone(), 10_000);
	let proxy_server = Arc::new(ProxyServer::new(
		whitelist,
		s3_credentials,
		settings.s3_region.clone(),
		proxy_audit_tx,
		settings.request_body_limit_bytes,
	));

	let policy = ContainerPolicy::from_settings(&settings);
	let runtime = Arc::new(DockerContainerRuntime::new(
		settings.container_image.clone(),
		Duration::from_secs(30),
	));
	let orchestrator = Arc::new(Orchestrator::with_proxy(
		runtime,
		policy,
		settings.container_image.clone(),
		settings.container_base_dir.clone(),
		settings.proxy_socket_dir.clone(),
		settings.pool_size,
		Duration::from_secs(settings.idle_ttl_secs),
		Some(proxy_server),
	));

	let oidc = if let Some(discovery_url) = &settings.oidc_discovery_url {
		let client_id = settings.oidc_client_id.clone().unwrap_or_default();
		let provider = Arc::new(OidcProvider::new(discovery_url.clone(), client_id));
		if let Err(e) = provider.initialize().await {
			eprintln!("failed to initialize OIDC provider ({}); refusing to start", e);
			return;
		}
		Some(provider)
	} else {
		warn!("no OIDC discovery URL configured; ingress executor auth is disabled");
		None
	};

	let pipeline = Arc::new(Pipeline {
		orchestrator: orchestrator.clone(),
		sync_engine,
		gateway: gateway.clone(),
		lock_registry,
		workspace_registry: workspace_registry.clone(),
		agent_client: Arc::new(pipeline::MockAgentClient {
			session_id: "agent-substrate".to_string(),
		}),
		persist_sender,
		metrics: obs_state.metrics.clone(),
		run_timeout: Duration::from_secs(settings.run_timeout_secs),
		heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
		heartbeat_failure_limit: settings.heartbeat_failure_limit,
	});

	let app_state = AppState {
		pipeline,
		orchestrator: orchestrator.clone(),
		gateway,
		workspace_registry,
		audit_repo,
		metrics: obs_state.metrics.clone(),
		sync_metrics,
		oidc,
		object_size_cap_bytes: settings.object_size_cap_bytes,
	};

	let app = ingress::router(&app_state)
		.route("/health", get(|| async { "OK" }))
		.route("/health/db", get(health::db_health))
		.route("/health/live", get(health::liveness))
		.route("/metrics", get(metrics_text))
		.layer(TraceLayer::new_for_http())
		.layer(NormalizePathLayer::trim_trailing_slash())
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("strict-transport-security"),
			HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("x-frame-options"),
			HeaderValue::from_static("DENY"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("x-content-type-options"),
			HeaderValue::from_static("nosniff"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("referrer-policy"),
			HeaderValue::from_static("strict-origin-when-cross-origin"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("permissions-policy"),
			HeaderValue::from_static("geolocation=(), microphone=()"),
		))
		.with_state(app_state);

	let certs = match settings.tls_cert.as_deref().map(Path::new).map(tls_utils::load_certs) {
		Some(Ok(c)) => c,
		Some(Err(e)) => {
			eprintln!("failed to load TLS certs ({}); refusing to start", e);
			return;
		}
		None => {
			eprintln!("no tls_cert configured; refusing to start");
			return;
		}
	};
	let key = match settings.tls_key.as_deref().map(Path::new).map(tls_utils::load_private_key) {
		Some(Ok(k)) => k,
		Some(Err(e)) => {
			eprintln!("failed to load TLS private key ({}); refusing to start", e);
			return;
		}
		None => {
			eprintln!("no tls_key configured; refusing to start");
			return;
		}
	};

	if certs.is_empty() {
		eprintln!("no TLS certificates loaded; refusing to start");
		return;
	}
	let leaf = &certs[0];

	match tls_utils::is_self_signed(leaf) {
		Ok(true) => {
			eprintln!("TLS certificate is self-signed; refusing to start");
			return;
		}
		Err(e) => {
			eprintln!("failed to evaluate TLS certificate ({}); refusing to start", e);
			return;
		}
		_ => {}
	}

	match tls_utils::is_cert_expired(leaf) {
		Ok(true) => {
			eprintln!("TLS certificate is expired; refusing to start");
			return;
		}
		Err(e) => {
			eprintln!("failed to evaluate TLS certificate expiry ({}); refusing to start", e);
			return;
		}
		_ => {}
	}

	if !settings.host.is_empty() {
		let mut matched = false;
		if let Ok(sans) = tls_utils::dns_names_from_cert(leaf) {
			if sans.iter().any(|s| s == &settings.host) {
				matched = true;
			}
		}
		if !matched {
			if let Ok(Some(cn)) = tls_utils::first_common_name(leaf) {
				if cn == settings.host {
					matched = true;
				}
			}
		}
		if !matched {
			eprintln!(
				"TLS certificate does not cover configured host '{}' in CN or SAN; refusing to start",
				settings.host
			);
			return;
		}
	}

	let server_cfg = match tls_utils::build_server_config_tls13(certs, key) {
		Ok(cfg) => cfg,
		Err(e) => {
			eprintln!("failed to build TLS server config: {}", e);
			return;
		}
	};
	let acceptor = TlsAcceptor::from(server_cfg);

	let bind_addr: SocketAddr = match format!("{}:{}", settings.host, settings.port).parse() {
		Ok(a) => a,
		Err(e) => {
			eprintln!("invalid listen address: {}", e);
			return;
		}
	};
	let listener = match TcpListener::bind(bind_addr).await {
		Ok(l) => l,
		Err(e) => {
			eprintln!("failed to bind {}: {}", bind_addr, e);
			return;
		}
	};

	info!("agent-substrate ingress listening on https://{}", bind_addr);

	let reap_orchestrator = orchestrator.clone();
	let reap_interval = Duration::from_secs(settings.idle_ttl_secs.max(1));
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(reap_interval);
		loop {
			ticker.tick().await;
			let destroyed = reap_orchestrator.reap().await;
			if !destroyed.is_empty() {
				info!("reap pass destroyed {} idle container(s)", destroyed.len());
			}
		}
	});

	loop {
		let (tcp_stream, peer_addr) = match listener.accept().await {
			Ok(t) => t,
			Err(e) => {
				error!("accept error: {}", e);
				tokio::time::sleep(Duration::from_millis(100)).await;
				continue;
			}
		};

		let acceptor = acceptor.clone();
		let app = app.clone();
		let burst = settings.rate_limit_burst;
		let rps = settings.rate_limit_rps;
		let body_cap = settings.request_body_limit_bytes;

		tokio::spawn(async move {
			let _ = tcp_stream.set_nodelay(true);

			let tls_stream = match acceptor.accept(tcp_stream).await {
				Ok(s) => s,
				Err(e) => {
					warn!("TLS handshake failed ({}): {}", peer_addr, e);
					return;
				}
			};

			let req_headers: Arc<[HeaderName]> = Arc::from(
				vec![
					HeaderName::from_static("authorization"),
					HeaderName::from_static("cookie"),
				]
				.into_boxed_slice(),
			);
			let res_headers: Arc<[HeaderName]> =
				Arc::from(vec![HeaderName::from_static("set-cookie")].into_boxed_slice());

			let svc = ServiceBuilder::new()
				.layer(CatchPanicLayer::new())
				.concurrency_limit(100)
				.load_shed()
				.timeout(Duration::from_secs(30))
				.layer(RequestBodyLimitLayer::new(body_cap))
				.layer(RequestBodyTimeoutLayer::new(Duration::from_secs(30)))
				.layer(crate::devops::SharedRateLimitLayer::new(burst, rps))
				.layer(SetSensitiveRequestHeadersLayer::from_shared(req_headers))
				.layer(SetSensitiveResponseHeadersLayer::from_shared(res_headers))
				.service(app.into_service());

			let hyper_svc = TowerToHyperService::new(svc);
			let io = TokioIo::new(tls_stream);
			let builder = AutoBuilder::new(TokioExecutor::new());
			let conn = builder.serve_connection(io, hyper_svc);

			if let Err(err) = conn.await {
				warn!("connection error ({}): {}", peer_addr, err);
			}
		});
	}
}
