pub mod audit;
pub mod signing;
pub mod whitelist;

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use tokio::net::{TcpStream, UnixListener};

use crate::errors::CoreError;
use crate::gateway::s3::S3Credentials;
use audit::{AuditRecord, AuditSender};
use whitelist::{SigningProfile, Whitelist, WhitelistVerdict};

/// The egress path every sandbox container is bound to: a distinct local
/// Unix socket per container, filesystem-permissioned to the container's
/// mapped UID (§4.B). One [`ProxyServer`] instance per host serves every
/// container's socket.
pub struct ProxyServer {
	whitelist: Arc<Whitelist>,
	credentials: S3Credentials,
	region: String,
	audit_tx: AuditSender,
	body_cap_bytes: usize,
	sockets: DashMap<String, PathBuf>,
}

impl ProxyServer {
	pub fn new(
		whitelist: Whitelist,
		credentials: S3Credentials,
		region: impl Into<String>,
		audit_tx: AuditSender,
		body_cap_bytes: usize,
	) -> Self {
		Self {
			whitelist: Arc::new(whitelist),
			credentials,
			region: region.into(),
			audit_tx,
			body_cap_bytes,
			sockets: DashMap::new(),
		}
	}

	/// Bind a per-container socket and restrict it to the container's
	/// mapped UID, ahead of the container itself starting (§4.C "the proxy
	/// socket is pre-bound before container start").
	pub async fn bind_container_socket(
		&self,
		container_id: &str,
		socket_path: &Path,
		owner_uid: u32,
	) -> Result<(), CoreError> {
		if socket_path.exists() {
			let _ = std::fs::remove_file(socket_path);
		}
		let listener = UnixListener::bind(socket_path)
			.map_err(|e| CoreError::infrastructure("credential_injection_proxy", e))?;

		restrict_socket_permissions(socket_path, owner_uid)
			.map_err(|e| CoreError::infrastructure("credential_injection_proxy", e))?;

		self.sockets
			.insert(container_id.to_string(), socket_path.to_path_buf());

		let whitelist = self.whitelist.clone();
		let credentials = self.credentials.clone();
		let region = self.region.clone();
		let audit_tx = self.audit_tx.clone();
		let body_cap_bytes = self.body_cap_bytes;
		let container_id = container_id.to_string();

		tokio::spawn(async move {
			loop {
				let (stream, _addr) = match listener.accept().await {
					Ok(v) => v,
					Err(e) => {
						error!("proxy socket accept failed for {}: {}", container_id, e);
						continue;
					}
				};

				let whitelist = whitelist.clone();
				let credentials = credentials.clone();
				let region = region.clone();
				let audit_tx = audit_tx.clone();
				let container_id = container_id.clone();

				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let container_id_for_svc = container_id.clone();
					let svc = service_fn(move |req: Request<Incoming>| {
						handle_request(
							req,
							whitelist.clone(),
							credentials.clone(),
							region.clone(),
							audit_tx.clone(),
							container_id_for_svc.clone(),
							body_cap_bytes,
						)
					});

					if let Err(e) = http1::Builder::new()
						.serve_connection(io, svc)
						.with_upgrades()
						.await
					{
						warn!("proxy connection for {} ended with error: {}", container_id, e);
					}
				});
			}
		});

		Ok(())
	}

	pub fn unbind_container_socket(&self, container_id: &str) {
		if let Some((_, path)) = self.sockets.remove(container_id) {
			let _ = std::fs::remove_file(path);
		}
	}
}

#[cfg(unix)]
fn restrict_socket_permissions(path: &Path, owner_uid: u32) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
	std::os::unix::fs::chown(path, Some(owner_uid), None)
}

#[cfg(not(unix))]
fn restrict_socket_permissions(_path: &Path, _owner_uid: u32) -> std::io::Result<()> {
	Ok(())
}

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
	Full::new(bytes.into())
		.map_err(|never| match never {})
		.boxed()
}

/// Dispatch a single proxied request: `CONNECT` establishes a raw tunnel
/// after whitelist approval (§4.B.4); every other method is forwarded,
/// optionally with injected signing headers (§4.B.3).
async fn handle_request(
	req: Request<Incoming>,
	whitelist: Arc<Whitelist>,
	credentials: S3Credentials,
	region: String,
	audit_tx: AuditSender,
	container_id: String,
	body_cap_bytes: usize,
) -> Result<Response<BoxBody>, Infallible> {
	let method = req.method().clone();
	let host = match request_host(&req) {
		Some(h) => h,
		None => {
			return Ok(deny_response(StatusCode::BAD_REQUEST));
		}
	};

	let verdict = whitelist.evaluate(&host, method.as_str());
	let allowed = matches!(verdict, WhitelistVerdict::Allowed { .. });

	let _ = audit_tx
		.send(AuditRecord {
			container_id: container_id.clone(),
			host: host.clone(),
			method: method.to_string(),
			allowed,
			timestamp: Utc::now(),
		})
		.await;

	let WhitelistVerdict::Allowed { signing_profile } = verdict else {
		info!("proxy denied {} {} for {}", method, host, container_id);
		// A generic rejection body: never echoes back request details that
		// might carry signing material (§4.B.5).
		return Ok(deny_response(StatusCode::FORBIDDEN));
	};

	if method == Method::CONNECT {
		return Ok(handle_connect(req, host, signing_profile).await);
	}

	forward_http(req, &host, signing_profile, &credentials, &region, body_cap_bytes).await
}

fn deny_response(status: StatusCode) -> Response<BoxBody> {
	Response::builder()
		.status(status)
		.body(full_body(Bytes::from_static(b"request denied")))
		.expect("building a static denial response never fails")
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
	if req.method() == Method::CONNECT {
		return req.uri().authority().map(|a| a.host().to_string());
	}
	req.uri()
		.host()
		.map(|h| h.to_string())
		.or_else(|| {
			req.headers()
				.get(hyper::header::HOST)
				.and_then(|v| v.to_str().ok())
				.map(|s| s.split(':').next().unwrap_or(s).to_string())
		})
}

/// Bridge bytes for an approved `CONNECT` tunnel without inspecting them.
/// Signing profiles that require header injection are never reached here
/// unless the upstream terminates TLS at the proxy (§4.B.4) — this
/// implementation only supports the pure-tunnel case.
async fn handle_connect(req: Request<Incoming>, host: String, _profile: SigningProfile) -> Response<BoxBody> {
	let authority = match req.uri().authority() {
		Some(a) => a.clone(),
		None => return deny_response(StatusCode::BAD_REQUEST),
	};
	let target = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(443));

	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => match TcpStream::connect(&target).await {
				Ok(mut server_stream) => {
					let mut client_stream = TokioIo::new(upgraded);
					if let Err(e) =
						tokio::io::copy_bidirectional(&mut client_stream, &mut server_stream).await
					{
						warn!("CONNECT tunnel to {} ended with error: {}", host, e);
					}
				}
				Err(e) => error!("failed to dial CONNECT target {}: {}", target, e),
			},
			Err(e) => error!("failed to upgrade CONNECT request for {}: {}", host, e),
		}
	});

	Response::builder()
		.status(StatusCode::OK)
		.body(full_body(Bytes::new()))
		.expect("building the CONNECT 200 response never fails")
}

/// Forward a non-`CONNECT` request to `host`, injecting signed headers per
/// `profile`, and translate upstream failures into `502`/`413` per §4.B's
/// failure semantics. Never retries — the sandboxed caller retries.
async fn forward_http(
	req: Request<Incoming>,
	host: &str,
	profile: SigningProfile,
	credentials: &S3Credentials,
	region: &str,
	body_cap_bytes: usize,
) -> Result<Response<BoxBody>, Infallible> {
	let method = req.method().clone();
	let uri = req.uri().clone();
	let headers = req.headers().clone();

	let body_bytes = match req.into_body().collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			error!("failed to read proxied request body: {}", e);
			return Ok(deny_response(StatusCode::BAD_GATEWAY));
		}
	};
	if body_bytes.len() > body_cap_bytes {
		return Ok(Response::builder()
			.status(StatusCode::PAYLOAD_TOO_LARGE)
			.body(full_body(Bytes::from_static(b"request body exceeds cap")))
			.expect("building the 413 response never fails"));
	}

	let scheme = "https";
	let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	let full_url = format!("{scheme}://{host}{path}");

	let signed = signing::sign(
		profile,
		credentials,
		region,
		"s3",
		method.as_str(),
		host,
		path,
		&body_bytes,
	);

	let client = reqwest::Client::new();
	let mut builder = client.request(
		reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
		&full_url,
	);
	for (name, value) in headers.iter() {
		if name == hyper::header::HOST {
			continue;
		}
		if let Ok(v) = value.to_str() {
			builder = builder.header(name.as_str(), v);
		}
	}
	for (name, value) in &signed.headers {
		builder = builder.header(name, value);
	}

	match builder.body(body_bytes.to_vec()).send().await {
		Ok(resp) => {
			let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
			let body = resp.bytes().await.unwrap_or_default();
			Ok(Response::builder()
				.status(status)
				.body(full_body(body))
				.expect("building the upstream response never fails"))
		}
		Err(e) => {
			error!("upstream request to {} failed: {}", host, e);
			Ok(deny_response(StatusCode::BAD_GATEWAY))
		}
	}
}

#[cfg(feature = "proxy-tests")]
mod tests {
	use super::*;
	use whitelist::WhitelistEntry;

	#[test]
	fn deny_response_never_includes_request_details() {
		let resp = deny_response(StatusCode::FORBIDDEN);
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	}

	#[test]
	fn whitelist_denies_by_default() {
		let wl = Whitelist::new(vec![WhitelistEntry {
			host_pattern: "api.anthropic.com".to_string(),
			allowed_methods: vec!["GET".to_string()],
			signing_profile: whitelist::SigningProfile::Transparent,
		}]);
		assert!(matches!(
			wl.evaluate("169.254.169.254", "GET"),
			WhitelistVerdict::Denied(_)
		));
	}
}
