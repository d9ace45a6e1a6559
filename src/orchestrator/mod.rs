pub mod container_runtime;
pub mod pool;

pub use container_runtime::{ContainerPolicy, ContainerRuntime, DockerContainerRuntime, NoopContainerRuntime};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::errors::{CoreError, CoreResult};
use crate::proxy::ProxyServer;
use pool::WarmPool;

/// State machine for a single sandbox container (§3). `Dead` is terminal;
/// every other state is reachable from `Allocated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
	Allocated,
	Running,
	Draining,
	Dead,
}

/// Container descriptor (§3). `container_id`, `conversation_id`,
/// `proxy_socket_path`, `workspace_host_path`, and `created_at` are
/// immutable once constructed; `state`, `last_activity_at`, and
/// `run_count` are mutated only by the orchestrator's single-writer
/// transition functions below.
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
	pub container_id: String,
	pub conversation_id: String,
	pub proxy_socket_path: PathBuf,
	pub workspace_host_path: PathBuf,
	pub created_at: Instant,
	pub state: ContainerState,
	pub last_activity_at: Instant,
	pub run_count: u32,
}

/// Outcome passed to [`Orchestrator::release`] so the pool/destroy
/// decision can be made without re-probing the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
	Healthy,
	Crashed,
}

/// Lifecycle manager for sandbox containers (§4.C). Owns the only mutable
/// view of container descriptors; the sync engine and pipeline interact
/// with containers exclusively through `acquire`/`release`/`reap`/`recover`.
pub struct Orchestrator {
	runtime: Arc<dyn ContainerRuntime>,
	policy: ContainerPolicy,
	image: String,
	base_dir: PathBuf,
	sockdir: PathBuf,
	idle_ttl: Duration,
	active: DashMap<String, ContainerDescriptor>,
	pool: Mutex<WarmPool>,
	proxy: Option<Arc<ProxyServer>>,
}

impl Orchestrator {
	pub fn new(
		runtime: Arc<dyn ContainerRuntime>,
		policy: ContainerPolicy,
		image: impl Into<String>,
		base_dir: impl Into<PathBuf>,
		sockdir: impl Into<PathBuf>,
		pool_size: usize,
		idle_ttl: Duration,
	) -> Self {
		Self::with_proxy(runtime, policy, image, base_dir, sockdir, pool_size, idle_ttl, None)
	}

	/// Like [`Orchestrator::new`], but also pre-binds each container's proxy
	/// socket through `proxy` ahead of `ContainerRuntime::start` (§4.C "the
	/// proxy socket is pre-bound before container start").
	#[allow(clippy::too_many_arguments)]
	pub fn with_proxy(
		runtime: Arc<dyn ContainerRuntime>,
		policy: ContainerPolicy,
		image: impl Into<String>,
		base_dir: impl Into<PathBuf>,
		sockdir: impl Into<PathBuf>,
		pool_size: usize,
		idle_ttl: Duration,
		proxy: Option<Arc<ProxyServer>>,
	) -> Self {
		Self {
			runtime,
			policy,
			image: image.into(),
			base_dir: base_dir.into(),
			sockdir: sockdir.into(),
			idle_ttl,
			active: DashMap::new(),
			pool: Mutex::new(WarmPool::new(pool_size)),
			proxy,
		}
	}

	fn bind_path(&self, conversation_id: &str) -> PathBuf {
		self.base_dir.join(conversation_id)
	}

	fn socket_path(&self, container_id: &str) -> PathBuf {
		self.sockdir.join(format!("{container_id}.sock"))
	}

	/// Acquire a container for `conversation_id`, reusing a warm-pool entry
	/// bound to this conversation when one exists, else creating a new
	/// container (§4.C `acquire`).
	pub async fn acquire(&self, conversation_id: &str) -> CoreResult<ContainerDescriptor> {
		if let Some(existing) = self.active.get(conversation_id) {
			if existing.state != ContainerState::Dead {
				return Err(CoreError::ConversationLocked {
					conversation_id: conversation_id.to_string(),
				});
			}
		}

		if let Some(mut pooled) = self.pool.lock().await.take(conversation_id) {
			if self.runtime.health_probe(&pooled.container_id).await {
				pooled.state = ContainerState::Running;
				pooled.last_activity_at = Instant::now();
				pooled.run_count += 1;
				self.active
					.insert(conversation_id.to_string(), pooled.clone());
				info!(
					"reused warm-pool container {} for conversation {}",
					pooled.container_id, conversation_id
				);
				return Ok(pooled);
			}
			warn!(
				"warm-pool container {} for {} failed health probe; discarding",
				pooled.container_id, conversation_id
			);
			let _ = self.runtime.kill(&pooled.container_id).await;
		}

		let container_id = format!("sbx-{}", uuid::Uuid::new_v4());
		let workspace_host_path = self.bind_path(conversation_id);
		let proxy_socket_path = self.socket_path(&container_id);

		tokio::fs::create_dir_all(&workspace_host_path)
			.await
			.map_err(|e| CoreError::infrastructure("container_orchestrator", e))?;

		if let Some(proxy) = &self.proxy {
			proxy
				.bind_container_socket(&container_id, &proxy_socket_path, 0)
				.await?;
		}

		self.runtime
			.start(
				&container_id,
				&self.image,
				&workspace_host_path,
				&proxy_socket_path,
				&self.policy,
			)
			.await?;

		let descriptor = ContainerDescriptor {
			container_id,
			conversation_id: conversation_id.to_string(),
			proxy_socket_path,
			workspace_host_path,
			created_at: Instant::now(),
			state: ContainerState::Running,
			last_activity_at: Instant::now(),
			run_count: 1,
		};
		self.active
			.insert(conversation_id.to_string(), descriptor.clone());
		Ok(descriptor)
	}

	/// Release a container at the end of a run (§4.C `release`): return it
	/// to the pool if healthy and there's room, else destroy it.
	pub async fn release(&self, conversation_id: &str, outcome: ReleaseOutcome) -> CoreResult<()> {
		let Some((_, mut descriptor)) = self.active.remove(conversation_id) else {
			return Ok(());
		};
		descriptor.state = ContainerState::Draining;
		descriptor.last_activity_at = Instant::now();

		let mut pool = self.pool.lock().await;
		if outcome == ReleaseOutcome::Healthy && pool.has_capacity() {
			descriptor.state = ContainerState::Allocated;
			pool.park(descriptor);
		} else {
			drop(pool);
			descriptor.state = ContainerState::Dead;
			self.runtime.kill(&descriptor.container_id).await?;
			if let Some(proxy) = &self.proxy {
				proxy.unbind_container_socket(&descriptor.container_id);
			}
		}
		Ok(())
	}

	/// Periodic GC pass (§4.C `reap`): destroy pooled containers whose
	/// idle time exceeds `idle_ttl` or whose health probe fails. Returns
	/// the container ids destroyed.
	pub async fn reap(&self) -> Vec<String> {
		let idle_ttl = self.idle_ttl;
		let mut expired = {
			let mut pool = self.pool.lock().await;
			pool.drain_expired(|d| d.last_activity_at.elapsed() >= idle_ttl)
		};

		// Health-probe the survivors too; a pooled container can die without
		// the orchestrator noticing until the next reap pass.
		let mut still_alive = Vec::new();
		{
			let mut pool = self.pool.lock().await;
			let remaining = pool.drain_expired(|_| true);
			for d in remaining {
				if self.runtime.health_probe(&d.container_id).await {
					still_alive.push(d);
				} else {
					expired.push(d);
				}
			}
			for d in still_alive {
				pool.park(d);
			}
		}

		let mut destroyed = Vec::with_capacity(expired.len());
		for descriptor in expired {
			if self.runtime.kill(&descriptor.container_id).await.is_ok() {
				if let Some(proxy) = &self.proxy {
					proxy.unbind_container_socket(&descriptor.container_id);
				}
				destroyed.push(descriptor.container_id.clone());
			}
		}
		destroyed
	}

	/// Crash recovery (§4.C `recover`): destroy the dead container, allocate
	/// a fresh one for the same conversation, and return it so the pipeline
	/// can re-sync the workspace and abort the current turn with a
	/// retriable failure.
	pub async fn recover(&self, conversation_id: &str) -> CoreResult<ContainerDescriptor> {
		if let Some((_, dead)) = self.active.remove(conversation_id) {
			let _ = self.runtime.kill(&dead.container_id).await;
			if let Some(proxy) = &self.proxy {
				proxy.unbind_container_socket(&dead.container_id);
			}
		}
		self.acquire(conversation_id).await
	}

	pub fn descriptor_for(&self, conversation_id: &str) -> Option<ContainerDescriptor> {
		self.active.get(conversation_id).map(|d| d.clone())
	}

	pub fn active_count(&self) -> usize {
		self.active.len()
	}
}

#[cfg(feature = "orchestrator-tests")]
mod tests {
	use super::*;
	use std::sync::Arc;

	fn test_orchestrator() -> Orchestrator {
		Orchestrator::new(
			Arc::new(NoopContainerRuntime::new()),
			ContainerPolicy {
				network_mode: "none",
				readonly_rootfs: true,
				tmpfs_size: "256m".to_string(),
				storage_size: "1g".to_string(),
				memory: "2g".to_string(),
				cpu_quota: "2".to_string(),
				pids_limit: 256,
				cap_drop: "ALL",
				no_new_privileges: true,
				seccomp_profile: None,
				apparmor_profile: None,
				userns_remap: true,
			},
			"agent-sandbox:latest",
			std::env::temp_dir().join("agent-substrate-test-base"),
			std::env::temp_dir().join("agent-substrate-test-sock"),
			2,
			Duration::from_millis(50),
		)
	}

	#[tokio::test]
	async fn acquire_creates_a_running_container() {
		let orch = test_orchestrator();
		let d = orch.acquire("conv-1").await.unwrap();
		assert_eq!(d.state, ContainerState::Running);
		assert_eq!(orch.active_count(), 1);
	}

	#[tokio::test]
	async fn second_acquire_for_same_conversation_conflicts() {
		let orch = test_orchestrator();
		let _d = orch.acquire("conv-1").await.unwrap();
		let err = orch.acquire("conv-1").await.unwrap_err();
		assert_eq!(err.code(), "CONVERSATION_LOCKED");
	}

	#[tokio::test]
	async fn release_healthy_returns_to_pool_and_allows_reacquire() {
		let orch = test_orchestrator();
		let d1 = orch.acquire("conv-1").await.unwrap();
		orch.release("conv-1", ReleaseOutcome::Healthy).await.unwrap();
		assert_eq!(orch.active_count(), 0);

		let d2 = orch.acquire("conv-1").await.unwrap();
		assert_eq!(d1.container_id, d2.container_id, "should reuse the pooled container");
	}

	#[tokio::test]
	async fn release_crashed_destroys_the_container() {
		let orch = test_orchestrator();
		let d1 = orch.acquire("conv-1").await.unwrap();
		orch.release("conv-1", ReleaseOutcome::Crashed).await.unwrap();

		let d2 = orch.acquire("conv-1").await.unwrap();
		assert_ne!(d1.container_id, d2.container_id, "should not reuse a crashed container");
	}

	#[tokio::test]
	async fn reap_destroys_idle_pooled_containers_past_ttl() {
		let orch = test_orchestrator();
		let _d1 = orch.acquire("conv-1").await.unwrap();
		orch.release("conv-1", ReleaseOutcome::Healthy).await.unwrap();

		tokio::time::sleep(Duration::from_millis(80)).await;
		let destroyed = orch.reap().await;
		assert_eq!(destroyed.len(), 1);
	}

	#[tokio::test]
	async fn recover_destroys_and_reallocates() {
		let orch = test_orchestrator();
		let d1 = orch.acquire("conv-1").await.unwrap();
		let d2 = orch.recover("conv-1").await.unwrap();
		assert_ne!(d1.container_id, d2.container_id);
		assert_eq!(orch.active_count(), 1);
	}

	#[tokio::test]
	async fn at_most_one_active_descriptor_per_conversation() {
		let orch = test_orchestrator();
		let _d1 = orch.acquire("conv-1").await.unwrap();
		let _d2 = orch.acquire("conv-2").await.unwrap();
		assert_eq!(orch.active_count(), 2);
		assert!(orch.acquire("conv-1").await.is_err());
	}
}
