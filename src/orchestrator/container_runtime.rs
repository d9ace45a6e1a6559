use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::Settings;
use crate::errors::{CoreError, CoreResult};

/// The isolation policy applied to every sandbox container (§4.C's option
/// table). Built once from [`Settings`] at orchestrator construction and
/// applied identically to every `acquire`.
#[derive(Debug, Clone)]
pub struct ContainerPolicy {
	pub network_mode: &'static str,
	pub readonly_rootfs: bool,
	pub tmpfs_size: String,
	pub storage_size: String,
	pub memory: String,
	pub cpu_quota: String,
	pub pids_limit: u32,
	pub cap_drop: &'static str,
	pub no_new_privileges: bool,
	pub seccomp_profile: Option<String>,
	pub apparmor_profile: Option<String>,
	pub userns_remap: bool,
}

impl ContainerPolicy {
	pub fn from_settings(settings: &Settings) -> Self {
		Self {
			network_mode: "none",
			readonly_rootfs: true,
			tmpfs_size: settings.container_tmpfs_size.clone(),
			storage_size: settings.container_storage_size.clone(),
			memory: settings.container_memory.clone(),
			cpu_quota: settings.container_cpu_quota.clone(),
			pids_limit: settings.container_pids_limit,
			cap_drop: "ALL",
			no_new_privileges: true,
			seccomp_profile: settings.seccomp_profile_path.clone(),
			apparmor_profile: settings.apparmor_profile_name.clone(),
			userns_remap: settings.userns_remap_enabled,
		}
	}
}

/// Abstraction over the actual container runtime so the orchestrator's
/// acquire/release/reap state machine can be exercised in tests without a
/// real `docker` binary on PATH. Mirrors the teacher's
/// `docker_manager::start_dev_db_with_opts` split between command
/// construction and a swappable execution path.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
	async fn start(
		&self,
		container_id: &str,
		image: &str,
		workspace_host_path: &Path,
		proxy_socket_path: &Path,
		policy: &ContainerPolicy,
	) -> CoreResult<()>;

	async fn health_probe(&self, container_id: &str) -> bool;

	async fn kill(&self, container_id: &str) -> CoreResult<()>;
}

/// Real runtime: shells out to `docker run`, carrying every isolation flag
/// named in §4.C. Command construction and timeout-wrapped execution mirror
/// `devops::docker_manager::run_command_with_timeout`.
pub struct DockerContainerRuntime {
	image: String,
	control_timeout: Duration,
}

impl DockerContainerRuntime {
	pub fn new(image: impl Into<String>, control_timeout: Duration) -> Self {
		Self {
			image: image.into(),
			control_timeout,
		}
	}

	fn build_run_command(
		&self,
		container_id: &str,
		workspace_host_path: &Path,
		proxy_socket_path: &Path,
		policy: &ContainerPolicy,
	) -> Command {
		let mut cmd = Command::new("docker");
		cmd.arg("run")
			.arg("-d")
			.arg("--name")
			.arg(container_id)
			.arg("--network")
			.arg(policy.network_mode)
			.arg("--cap-drop")
			.arg(policy.cap_drop)
			.arg("--pids-limit")
			.arg(policy.pids_limit.to_string())
			.arg("--memory")
			.arg(&policy.memory)
			.arg("--cpus")
			.arg(&policy.cpu_quota)
			.arg("--tmpfs")
			.arg(format!("/tmp:size={}", policy.tmpfs_size))
			.arg("--storage-opt")
			.arg(format!("size={}", policy.storage_size))
			.arg("-v")
			.arg(format!("{}:/workspace", workspace_host_path.display()))
			.arg("-v")
			.arg(format!(
				"{}:/var/run/proxy.sock",
				proxy_socket_path.display()
			));

		if policy.readonly_rootfs {
			cmd.arg("--read-only");
		}
		if policy.no_new_privileges {
			cmd.arg("--security-opt").arg("no-new-privileges");
		}
		if let Some(seccomp) = &policy.seccomp_profile {
			cmd.arg("--security-opt")
				.arg(format!("seccomp={}", seccomp));
		}
		if let Some(apparmor) = &policy.apparmor_profile {
			cmd.arg("--security-opt")
				.arg(format!("apparmor={}", apparmor));
		}
		if policy.userns_remap {
			cmd.arg("--userns").arg("remap-host");
		}

		cmd.arg(&self.image);
		cmd
	}
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
	async fn start(
		&self,
		container_id: &str,
		_image: &str,
		workspace_host_path: &Path,
		proxy_socket_path: &Path,
		policy: &ContainerPolicy,
	) -> CoreResult<()> {
		let mut cmd = self.build_run_command(
			container_id,
			workspace_host_path,
			proxy_socket_path,
			policy,
		);
		info!("starting sandbox container {}", container_id);

		match timeout(self.control_timeout, cmd.output()).await {
			Ok(Ok(output)) if output.status.success() => Ok(()),
			Ok(Ok(output)) => Err(CoreError::infrastructure(
				"container_orchestrator",
				anyhow::anyhow!(
					"docker run exited with {}: {}",
					output.status,
					String::from_utf8_lossy(&output.stderr)
				),
			)),
			Ok(Err(e)) => Err(CoreError::infrastructure("container_orchestrator", e)),
			Err(_) => Err(CoreError::Timeout(format!(
				"container {} did not start within {:?}",
				container_id, self.control_timeout
			))),
		}
	}

	async fn health_probe(&self, container_id: &str) -> bool {
		let mut cmd = Command::new("docker");
		cmd.arg("inspect")
			.arg("-f")
			.arg("{{.State.Running}}")
			.arg(container_id);

		match timeout(self.control_timeout, cmd.output()).await {
			Ok(Ok(output)) if output.status.success() => {
				String::from_utf8_lossy(&output.stdout).trim() == "true"
			}
			_ => false,
		}
	}

	async fn kill(&self, container_id: &str) -> CoreResult<()> {
		let mut cmd = Command::new("docker");
		cmd.arg("rm").arg("-f").arg(container_id);

		match timeout(self.control_timeout, cmd.output()).await {
			Ok(Ok(output)) if output.status.success() => Ok(()),
			Ok(Ok(output)) => {
				warn!(
					"docker rm -f {} returned non-zero: {}",
					container_id,
					String::from_utf8_lossy(&output.stderr)
				);
				Ok(())
			}
			Ok(Err(e)) => Err(CoreError::infrastructure("container_orchestrator", e)),
			Err(_) => {
				error!("timed out killing container {}", container_id);
				Err(CoreError::Timeout(format!(
					"kill of {} timed out",
					container_id
				)))
			}
		}
	}
}

/// In-memory test double: every container is "running" as soon as it's
/// started, and stays healthy until explicitly killed. Lets orchestrator
/// state-machine tests run without a `docker` binary.
#[derive(Default)]
pub struct NoopContainerRuntime {
	alive: dashmap::DashSet<String>,
}

impl NoopContainerRuntime {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_dead(&self, container_id: &str) {
		self.alive.remove(container_id);
	}
}

#[async_trait]
impl ContainerRuntime for NoopContainerRuntime {
	async fn start(
		&self,
		container_id: &str,
		_image: &str,
		_workspace_host_path: &Path,
		_proxy_socket_path: &Path,
		_policy: &ContainerPolicy,
	) -> CoreResult<()> {
		self.alive.insert(container_id.to_string());
		Ok(())
	}

	async fn health_probe(&self, container_id: &str) -> bool {
		self.alive.contains(container_id)
	}

	async fn kill(&self, container_id: &str) -> CoreResult<()> {
		self.alive.remove(container_id);
		Ok(())
	}
}
