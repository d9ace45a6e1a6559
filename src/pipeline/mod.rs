//! Agent Run Pipeline (§4.E): the per-conversation state machine that
//! drives one run end to end — reserve container, sync-in, invoke the
//! agent, stream SSE, sync-out, release.
//!
//! ```text
//! queued → preparing → executing → finalizing → succeeded
//!                          │            │
//!                          ▼            ▼
//!                       crashed → recovered → (retry or failed)
//!                          │
//!                          └──→ failed
//! ```

pub mod events;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout as tokio_timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::gateway::ObjectStoreGateway;
use crate::lock_registry::ConversationLockRegistry;
use crate::observability::MetricsRegistry;
use crate::orchestrator::{Orchestrator, ReleaseOutcome};
use crate::persist::PersistSender;
use crate::sse::FramerHandle;
use crate::sync::{FileSource, SyncEngine, WorkspaceRegistry};
use events::{AgentEvent, AgentTurnContext, FileInventoryEntry, UsageCounters, build_augmented_system_prompt};

/// Run state (§3 "Run record"). `Succeeded`/`Failed`/`Crashed` are the
/// state machine's terminal states; `Recovered` is an internal step on the
/// crash path, not a terminal state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
	Queued,
	Preparing,
	Executing,
	Finalizing,
	Succeeded,
	Failed,
	Crashed,
	Recovered,
}

impl RunState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, RunState::Succeeded | RunState::Failed | RunState::Crashed)
	}
}

/// Run record (§3). Persisted through [`crate::persist::repo::AuditRepo`].
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
	pub run_id: Uuid,
	pub conversation_id: String,
	pub tenant_id: String,
	pub state: RunState,
	pub started_at: DateTime<Utc>,
	pub ended_at: Option<DateTime<Utc>>,
	pub usage: UsageCounters,
	pub cost_usd: f64,
	pub num_turns: u32,
	pub error: Option<String>,
}

impl RunRecord {
	fn new(run_id: Uuid, tenant_id: &str, conversation_id: &str) -> Self {
		Self {
			run_id,
			conversation_id: conversation_id.to_string(),
			tenant_id: tenant_id.to_string(),
			state: RunState::Queued,
			started_at: Utc::now(),
			ended_at: None,
			usage: UsageCounters::default(),
			cost_usd: 0.0,
			num_turns: 0,
			error: None,
		}
	}
}

/// Executor identity carried on the `/stream` request (§6).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct Executor {
	pub user_id: String,
	pub name: String,
	pub email: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub employee_id: Option<String>,
}

/// `request_data` payload of the multipart `/stream` request (§6).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct RunRequest {
	pub user_input: String,
	pub executor: Executor,
	#[serde(default)]
	pub tokens: HashMap<String, String>,
	#[serde(default)]
	pub preferred_skills: Vec<String>,
}

/// Abstraction over the agent SDK's streaming turn invocation. The SDK's
/// internals are out of scope (§1); this is only the boundary the
/// pipeline calls through, analogous to the teacher's resilient-client
/// seam for third-party calls.
#[async_trait]
pub trait AgentClient: Send + Sync + 'static {
	async fn run_turn(
		&self,
		ctx: AgentTurnContext,
		events_tx: mpsc::Sender<AgentEvent>,
	) -> CoreResult<()>;
}

/// In-memory test double: emits a session start, one text delta, and a
/// completion event, synthesizing a successful turn without a real agent
/// SDK or sandbox.
pub struct MockAgentClient {
	pub session_id: String,
}

#[async_trait]
impl AgentClient for MockAgentClient {
	async fn run_turn(
		&self,
		_ctx: AgentTurnContext,
		events_tx: mpsc::Sender<AgentEvent>,
	) -> CoreResult<()> {
		let _ = events_tx
			.send(AgentEvent::SessionBegin {
				session_id: self.session_id.clone(),
			})
			.await;
		let _ = events_tx
			.send(AgentEvent::PartialText {
				content: "working on it".to_string(),
			})
			.await;
		let _ = events_tx
			.send(AgentEvent::Completion {
				subtype: "success".to_string(),
				result: json!("done"),
				usage: UsageCounters {
					input: 100,
					output: 50,
					total: 150,
					..Default::default()
				},
				cost_usd: 0.01,
				num_turns: 1,
				duration_ms: 10,
			})
			.await;
		Ok(())
	}
}

/// Everything the pipeline needs to drive one run, wired once at
/// bootstrap and shared across every conversation.
pub struct Pipeline {
	pub orchestrator: Arc<Orchestrator>,
	pub sync_engine: Arc<SyncEngine>,
	pub gateway: Arc<dyn ObjectStoreGateway>,
	pub lock_registry: Arc<ConversationLockRegistry>,
	pub workspace_registry: Arc<WorkspaceRegistry>,
	pub agent_client: Arc<dyn AgentClient>,
	pub persist_sender: PersistSender,
	pub metrics: Arc<MetricsRegistry>,
	pub run_timeout: Duration,
	pub heartbeat_interval: Duration,
	pub heartbeat_failure_limit: u32,
}

impl Pipeline {
	/// Drive a single run to a terminal state, streaming every translated
	/// SSE event to `sse` as it happens (§4.E).
	pub async fn run(
		&self,
		tenant: &str,
		conversation_id: &str,
		request: RunRequest,
		sse: FramerHandle,
	) -> RunRecord {
		let run_id = Uuid::new_v4();
		let mut record = RunRecord::new(run_id, tenant, conversation_id);
		let cancel = CancellationToken::new();

		let Some(_lock) = self.lock_registry.try_acquire(conversation_id) else {
			self.metrics.conversation_locked_total.inc();
			record.state = RunState::Failed;
			record.ended_at = Some(Utc::now());
			record.error = Some("conversation already has a run in flight".to_string());
			sse.send_guaranteed(
				"error",
				json!({"code": "CONVERSATION_LOCKED", "message": record.error.clone().unwrap()}),
			)
			.await;
			self.persist(record.clone()).await;
			return record;
		};

		record.state = RunState::Preparing;
		self.persist(record.clone()).await;

		let heartbeat_task = self.spawn_heartbeat(sse.clone(), cancel.clone());

		let outcome = self.drive(tenant, conversation_id, &request, &sse, &cancel, &mut record).await;
		heartbeat_task.abort();

		match outcome {
			Ok(()) => {
				if record.state != RunState::Failed && record.state != RunState::Crashed {
					record.state = RunState::Succeeded;
				}
			}
			Err(e) => {
				record.state = match record.state {
					RunState::Crashed => RunState::Crashed,
					_ => RunState::Failed,
				};
				record.error = Some(e.to_sse_payload().message);
				sse.send_guaranteed("error", json!(e.to_sse_payload())).await;
			}
		}
		record.ended_at = Some(Utc::now());
		self.metrics.runs_started_total.inc();
		self.metrics
			.runs_by_terminal_state
			.with_label_values(&[state_label(record.state)])
			.inc();

		let subtype = if record.error.is_some() {
			"error_during_execution"
		} else {
			"success"
		};
		sse.send_guaranteed(
			"result",
			json!({
				"subtype": subtype,
				"result": record.error.clone().unwrap_or_else(|| "ok".to_string()),
				"usage": record.usage,
				"cost_usd": record.cost_usd,
				"num_turns": record.num_turns,
				"duration_ms": (Utc::now() - record.started_at).num_milliseconds().max(0),
			}),
		)
		.await;

		self.persist(record.clone()).await;
		record
	}

	async fn drive(
		&self,
		tenant: &str,
		conversation_id: &str,
		request: &RunRequest,
		sse: &FramerHandle,
		cancel: &CancellationToken,
		record: &mut RunRecord,
	) -> CoreResult<()> {
		let descriptor = self.orchestrator.acquire(conversation_id).await?;
		self.metrics.containers_acquired_total.inc();
		self.metrics
			.active_containers
			.set(self.orchestrator.active_count() as i64);

		let guard_result = self
			.drive_with_container(tenant, conversation_id, request, sse, cancel, record, descriptor)
			.await;

		let outcome = match &guard_result {
			Ok(()) => ReleaseOutcome::Healthy,
			Err(CoreError::ContainerCrashed(_)) => ReleaseOutcome::Crashed,
			Err(_) => ReleaseOutcome::Healthy,
		};
		self.orchestrator.release(conversation_id, outcome).await.ok();
		self.metrics
			.active_containers
			.set(self.orchestrator.active_count() as i64);

		guard_result
	}

	async fn drive_with_container(
		&self,
		tenant: &str,
		conversation_id: &str,
		request: &RunRequest,
		sse: &FramerHandle,
		cancel: &CancellationToken,
		record: &mut RunRecord,
		mut descriptor: crate::orchestrator::ContainerDescriptor,
	) -> CoreResult<()> {
		let pre_run_user_uploads: HashSet<String> = self
			.workspace_registry
			.list(conversation_id)
			.into_iter()
			.filter(|r| r.source == FileSource::UserUpload)
			.map(|r| r.file_path)
			.collect();

		self.sync_engine
			.sync_in(tenant, conversation_id, &descriptor.workspace_host_path)
			.await?;

		record.state = RunState::Executing;
		self.persist(record.clone()).await;

		let (turn_result, at_tool_boundary) = self
			.run_one_turn(conversation_id, request, sse, cancel, record, &descriptor)
			.await;

		match turn_result {
			Ok(()) => {}
			Err(CoreError::ContainerCrashed(reason)) => {
				descriptor = self
					.recover_after_crash(
						tenant,
						conversation_id,
						request,
						sse,
						cancel,
						record,
						at_tool_boundary,
						reason,
					)
					.await?;
			}
			Err(e) => return Err(e),
		}

		record.state = RunState::Finalizing;
		self.persist(record.clone()).await;

		// Best-effort sync-out: per §9's resolved open question, finalizing
		// always attempts sync-out and folds per-file failures into the
		// run's error field rather than failing release.
		match self
			.sync_engine
			.sync_out(
				tenant,
				conversation_id,
				&descriptor.workspace_host_path,
				&self.workspace_registry,
			)
			.await
		{
			Ok((report, written)) => {
				let presented = crate::sync::compute_presented_files(&written, &pre_run_user_uploads);
				self.workspace_registry.set_presented(conversation_id, &presented);
				if !report.all_ok() {
					record.error = Some(format!(
						"{} file(s) failed to sync out",
						report.statuses.iter().filter(|s| !s.ok).count()
					));
				}
			}
			Err(e) => {
				record.error = Some(format!("sync-out failed: {e}"));
			}
		}

		Ok(())
	}

	/// Run one agent turn against `descriptor` to completion, timeout, or
	/// crash. Returns whether the last event observed before the turn ended
	/// was a tool call, so a crash can be judged against the "at a
	/// tool-call boundary" condition (§4.C `recover`) even though the crash
	/// itself carries no event payload.
	async fn run_one_turn(
		&self,
		conversation_id: &str,
		request: &RunRequest,
		sse: &FramerHandle,
		cancel: &CancellationToken,
		record: &mut RunRecord,
		descriptor: &crate::orchestrator::ContainerDescriptor,
	) -> (CoreResult<()>, bool) {
		let file_inventory: Vec<FileInventoryEntry> = self
			.workspace_registry
			.list(conversation_id)
			.iter()
			.map(FileInventoryEntry::from)
			.collect();

		let ctx = AgentTurnContext {
			conversation_id: conversation_id.to_string(),
			workspace_container_path: "/workspace".to_string(),
			file_inventory,
			user_input: request.user_input.clone(),
			proxy_socket_path: descriptor.proxy_socket_path.clone(),
		};
		let _system_prompt = build_augmented_system_prompt(&ctx);

		let (events_tx, mut events_rx) = mpsc::channel::<AgentEvent>(256);
		let agent_client = self.agent_client.clone();
		let turn_ctx = ctx.clone();
		let turn_handle = tokio::spawn(async move { agent_client.run_turn(turn_ctx, events_tx).await });

		let mut at_tool_boundary = false;
		let deadline = tokio_timeout(self.run_timeout, async {
			while let Some(event) = events_rx.recv().await {
				if cancel.is_cancelled() {
					break;
				}
				at_tool_boundary = matches!(event, AgentEvent::ToolCall { .. });
				self.translate_and_send(event, sse, record).await;
			}
		});

		let wait_result: CoreResult<()> = tokio::select! {
			res = deadline => {
				if res.is_err() {
					Err(CoreError::Timeout(format!(
						"run {} exceeded {:?}", record.run_id, self.run_timeout
					)))
				} else {
					Ok(())
				}
			}
			_ = cancel.cancelled() => {
				Err(CoreError::Timeout(format!(
					"run {} aborted after {} consecutive heartbeat failures",
					record.run_id, self.heartbeat_failure_limit
				)))
			}
		};

		if let Err(e) = wait_result {
			return (Err(e), at_tool_boundary);
		}

		let turn_result = match turn_handle.await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(CoreError::ContainerCrashed(e.to_string())),
			Err(e) => Err(CoreError::ContainerCrashed(e.to_string())),
		};
		(turn_result, at_tool_boundary)
	}

	/// Crash recovery (§4.C `recover`, §4.E): mark the run `crashed`,
	/// allocate a fresh container for the conversation, best-effort
	/// re-sync the workspace into it, mark the run `recovered`, and either
	/// re-issue the interrupted turn (if it crashed at a tool-call
	/// boundary) or surface the crash as a terminal failure. Attempted at
	/// most once per run: nothing here loops back into this helper.
	async fn recover_after_crash(
		&self,
		tenant: &str,
		conversation_id: &str,
		request: &RunRequest,
		sse: &FramerHandle,
		cancel: &CancellationToken,
		record: &mut RunRecord,
		at_tool_boundary: bool,
		reason: String,
	) -> CoreResult<crate::orchestrator::ContainerDescriptor> {
		record.state = RunState::Crashed;
		self.persist(record.clone()).await;

		let descriptor = self.orchestrator.recover(conversation_id).await?;
		self.metrics.containers_recovered_total.inc();
		self.metrics
			.active_containers
			.set(self.orchestrator.active_count() as i64);
		sse.send_guaranteed(
			"container_recovered",
			json!({"conversation_id": conversation_id, "reason": reason}),
		)
		.await;

		if let Err(e) = self
			.sync_engine
			.sync_in(tenant, conversation_id, &descriptor.workspace_host_path)
			.await
		{
			warn!("best-effort re-sync after recovery failed for {conversation_id}: {e}");
		}

		record.state = RunState::Recovered;
		self.persist(record.clone()).await;

		if !at_tool_boundary {
			return Err(CoreError::ContainerCrashed(reason));
		}

		record.state = RunState::Executing;
		self.persist(record.clone()).await;
		let (retry_result, _) = self
			.run_one_turn(conversation_id, request, sse, cancel, record, &descriptor)
			.await;
		retry_result?;
		Ok(descriptor)
	}

	async fn translate_and_send(&self, event: AgentEvent, sse: &FramerHandle, record: &mut RunRecord) {
		match event {
			AgentEvent::SessionBegin { session_id } => {
				sse.send_guaranteed(
					"session_start",
					json!({"session_id": session_id, "conversation_id": record.conversation_id}),
				)
				.await;
			}
			AgentEvent::PartialText { content } => {
				sse.send_collapsible("text_delta", json!({"content": content}));
			}
			AgentEvent::ReasoningTrace { content } => {
				sse.send_collapsible("thinking", json!({"content": content}));
			}
			AgentEvent::ToolCall {
				tool_use_id,
				tool_name,
				tool_input,
			} => {
				sse.send_guaranteed(
					"tool_use",
					json!({"tool_use_id": tool_use_id, "tool_name": tool_name, "tool_input": tool_input}),
				)
				.await;
			}
			AgentEvent::ToolResult {
				tool_use_id,
				result,
				is_error,
			} => {
				sse.send_guaranteed(
					"tool_result",
					json!({"tool_use_id": tool_use_id, "result": result, "is_error": is_error}),
				)
				.await;
			}
			AgentEvent::Completion {
				usage,
				cost_usd,
				num_turns,
				..
			} => {
				record.usage = usage;
				record.cost_usd = cost_usd;
				record.num_turns = num_turns;
			}
			AgentEvent::Fatal { code, message } => {
				sse.send_guaranteed("error", json!({"code": code, "message": message})).await;
			}
		}
	}

	fn spawn_heartbeat(&self, sse: FramerHandle, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
		let interval = self.heartbeat_interval;
		let failure_limit = self.heartbeat_failure_limit;
		let metrics = self.metrics.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			let mut consecutive_failures = 0u32;
			loop {
				ticker.tick().await;
				if cancel.is_cancelled() {
					return;
				}
				if sse.try_send_heartbeat() {
					consecutive_failures = 0;
				} else {
					consecutive_failures += 1;
					metrics.sse_heartbeat_failures_total.inc();
					if consecutive_failures >= failure_limit {
						cancel.cancel();
						return;
					}
				}
			}
		})
	}

	async fn persist(&self, record: RunRecord) {
		self.metrics.persist_jobs_submitted.inc();
		let _ = self.persist_sender.send(crate::persist::PersistJob::Run(record)).await;
	}
}

fn state_label(state: RunState) -> &'static str {
	match state {
		RunState::Queued => "queued",
		RunState::Preparing => "preparing",
		RunState::Executing => "executing",
		RunState::Finalizing => "finalizing",
		RunState::Succeeded => "succeeded",
		RunState::Failed => "failed",
		RunState::Crashed => "crashed",
		RunState::Recovered => "recovered",
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::gateway::local_fs::LocalFsGateway;
	use crate::observability::MetricsRegistry;
	use crate::orchestrator::{ContainerPolicy, NoopContainerRuntime};
	use crate::sse;
	use tempfile::tempdir;

	fn test_pipeline(base_dir: std::path::PathBuf) -> (Pipeline, mpsc::Receiver<crate::persist::PersistJob>) {
		let gateway: Arc<dyn ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(tempdir().unwrap().keep(), "workspaces", 10 * 1024 * 1024));
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
			base_dir,
			std::env::temp_dir().join("agent-substrate-pipeline-test-sock"),
			4,
			Duration::from_secs(300),
		));
		let (persist_tx, persist_rx) = mpsc::channel(32);
		let pipeline = Pipeline {
			orchestrator,
			sync_engine: Arc::new(SyncEngine::new(gateway.clone(), Arc::new(crate::sync::SyncMetrics::default()))),
			gateway,
			lock_registry: Arc::new(ConversationLockRegistry::new()),
			workspace_registry: Arc::new(WorkspaceRegistry::new()),
			agent_client: Arc::new(MockAgentClient {
				session_id: "sess-1".to_string(),
			}),
			persist_sender: persist_tx,
			metrics: Arc::new(MetricsRegistry::new()),
			run_timeout: Duration::from_secs(5),
			heartbeat_interval: Duration::from_millis(50),
			heartbeat_failure_limit: 3,
		};
		(pipeline, persist_rx)
	}

	fn test_request() -> RunRequest {
		RunRequest {
			user_input: "hello".to_string(),
			executor: Executor {
				user_id: "u1".to_string(),
				name: "Test User".to_string(),
				email: "test@example.com".to_string(),
				employee_id: None,
			},
			tokens: HashMap::new(),
			preferred_skills: vec![],
		}
	}

	#[tokio::test]
	async fn successful_run_reaches_succeeded() {
		let dir = tempdir().unwrap();
		let (pipeline, _rx) = test_pipeline(dir.path().to_path_buf());
		let (handle, mut rx) = sse::new_framer(64);
		let record = pipeline.run("acme", "conv-1", test_request(), handle).await;
		assert_eq!(record.state, RunState::Succeeded);
		assert_eq!(pipeline.orchestrator.active_count(), 0);

		let mut saw_result = false;
		while let Ok(frame) = rx.try_recv() {
			if frame.event == "result" {
				saw_result = true;
			}
		}
		assert!(saw_result);
	}

	#[tokio::test]
	async fn second_concurrent_run_is_conversation_locked() {
		let dir = tempdir().unwrap();
		let (pipeline, _rx) = test_pipeline(dir.path().to_path_buf());
		let _held = pipeline.lock_registry.try_acquire("conv-1").unwrap();

		let (handle, _rx2) = sse::new_framer(64);
		let record = pipeline.run("acme", "conv-1", test_request(), handle).await;
		assert_eq!(record.state, RunState::Failed);
		assert_eq!(record.error.as_deref(), Some("conversation already has a run in flight"));
	}
}
