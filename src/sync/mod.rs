//! Workspace Sync Engine (§4.D): bidirectional reconciliation between a
//! conversation's object-store prefix and the sandbox's bound directory,
//! plus presented-file detection.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::gateway::ObjectStoreGateway;

/// Whether a workspace file record was produced by a user upload or
/// written by the agent during a run (§3 "Workspace file record").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
	UserUpload,
	AiCreated,
}

/// Per-path workspace record (§3). `(conversation_id, file_path)` is
/// unique at any moment; every new write bumps `version`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkspaceFileRecord {
	pub file_id: Uuid,
	pub file_path: String,
	pub original_name: String,
	pub original_relative_path: String,
	pub size_bytes: u64,
	pub mime_type: String,
	pub version: u32,
	pub source: FileSource,
	pub is_presented: bool,
	pub content_hash: String,
}

/// In-process registry of workspace file records for all conversations.
/// The sync engine is the only writer; ingress read handlers (§6) query it
/// through [`WorkspaceRegistry::list`] / [`WorkspaceRegistry::presented`].
#[derive(Default)]
pub struct WorkspaceRegistry {
	by_conversation: dashmap::DashMap<String, dashmap::DashMap<String, WorkspaceFileRecord>>,
}

impl WorkspaceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn upsert(&self, conversation_id: &str, record: WorkspaceFileRecord) {
		self.by_conversation
			.entry(conversation_id.to_string())
			.or_default()
			.insert(record.file_path.clone(), record);
	}

	pub fn get(&self, conversation_id: &str, file_path: &str) -> Option<WorkspaceFileRecord> {
		self.by_conversation
			.get(conversation_id)?
			.get(file_path)
			.map(|r| r.clone())
	}

	pub fn list(&self, conversation_id: &str) -> Vec<WorkspaceFileRecord> {
		self.by_conversation
			.get(conversation_id)
			.map(|m| m.iter().map(|e| e.value().clone()).collect())
			.unwrap_or_default()
	}

	pub fn presented(&self, conversation_id: &str) -> Vec<WorkspaceFileRecord> {
		self.list(conversation_id)
			.into_iter()
			.filter(|r| r.is_presented)
			.collect()
	}

	/// Mark every record in `paths` as `is_presented = true`, clearing the
	/// flag on every other `ai_created` record for the conversation (the
	/// presented set is the union from the *most recent* run only, §3).
	pub fn set_presented(&self, conversation_id: &str, paths: &HashSet<String>) {
		if let Some(files) = self.by_conversation.get(conversation_id) {
			for mut entry in files.iter_mut() {
				entry.is_presented = paths.contains(entry.file_path.as_str());
			}
		}
	}
}

/// Atomic counters for sync activity, exposed via `to_prometheus_text()`
/// the same way the teacher's `sync::agent::SyncMetrics` composes into the
/// process-wide `/metrics` text (§10.2).
#[derive(Default)]
pub struct SyncMetrics {
	pub sync_in_files: AtomicU64,
	pub sync_in_bytes: AtomicU64,
	pub sync_in_deletions: AtomicU64,
	pub sync_in_failures: AtomicU64,
	pub sync_out_files: AtomicU64,
	pub sync_out_bytes: AtomicU64,
	pub sync_out_failures: AtomicU64,
}

impl SyncMetrics {
	pub fn to_prometheus_text(&self) -> String {
		let mut out = String::new();
		let lines = [
			(
				"agent_substrate_sync_in_files_total",
				"Files downloaded during sync-in",
				self.sync_in_files.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_in_bytes_total",
				"Bytes downloaded during sync-in",
				self.sync_in_bytes.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_in_deletions_total",
				"Local files deleted to match the object store during sync-in",
				self.sync_in_deletions.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_in_failures_total",
				"Sync-in failures",
				self.sync_in_failures.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_out_files_total",
				"Files uploaded during sync-out",
				self.sync_out_files.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_out_bytes_total",
				"Bytes uploaded during sync-out",
				self.sync_out_bytes.load(Ordering::Relaxed),
			),
			(
				"agent_substrate_sync_out_failures_total",
				"Sync-out failures",
				self.sync_out_failures.load(Ordering::Relaxed),
			),
		];
		for (name, help, value) in lines {
			out.push_str(&format!("# HELP {name} {help}\n"));
			out.push_str(&format!("# TYPE {name} counter\n"));
			out.push_str(&format!("{name} {value}\n"));
		}
		out
	}
}

/// Per-file outcome of a sync-in/sync-out pass, surfaced as `SDK_ERROR`
/// with per-file status on partial failure (§4.D "Safety").
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileSyncStatus {
	pub path: String,
	pub ok: bool,
	pub error: Option<String>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SyncReport {
	pub statuses: Vec<FileSyncStatus>,
}

impl SyncReport {
	pub fn all_ok(&self) -> bool {
		self.statuses.iter().all(|s| s.ok)
	}
}

pub struct SyncEngine {
	gateway: Arc<dyn ObjectStoreGateway>,
	metrics: Arc<SyncMetrics>,
}

impl SyncEngine {
	pub fn new(gateway: Arc<dyn ObjectStoreGateway>, metrics: Arc<SyncMetrics>) -> Self {
		Self { gateway, metrics }
	}

	pub fn metrics(&self) -> Arc<SyncMetrics> {
		self.metrics.clone()
	}

	/// Sync-in (§4.D): the object store is authoritative. Download every
	/// entry whose local copy is absent or hash-mismatched; delete local
	/// files that aren't listed remotely. Idempotent and retry-safe.
	pub async fn sync_in(
		&self,
		tenant: &str,
		conversation_id: &str,
		workspace_host_path: &Path,
	) -> CoreResult<SyncReport> {
		tokio::fs::create_dir_all(workspace_host_path)
			.await
			.map_err(|e| CoreError::infrastructure("workspace_sync_engine", e))?;

		let remote = self.gateway.list(tenant, conversation_id, "").await?;
		let remote_paths: HashSet<String> = remote.iter().map(|e| e.path.clone()).collect();

		let mut report = SyncReport::default();

		for entry in &remote {
			let local_path = workspace_host_path.join(&entry.path);
			let needs_download = match local_file_hash(&local_path).await {
				Some(hash) => hash != entry.content_hash,
				None => true,
			};
			if !needs_download {
				continue;
			}
			match self.gateway.get(tenant, conversation_id, &entry.path).await {
				Ok(bytes) => {
					if let Some(parent) = local_path.parent() {
						let _ = tokio::fs::create_dir_all(parent).await;
					}
					match tokio::fs::write(&local_path, &bytes).await {
						Ok(()) => {
							self.metrics.sync_in_files.fetch_add(1, Ordering::Relaxed);
							self.metrics
								.sync_in_bytes
								.fetch_add(bytes.len() as u64, Ordering::Relaxed);
							report.statuses.push(FileSyncStatus {
								path: entry.path.clone(),
								ok: true,
								error: None,
							});
						}
						Err(e) => {
							self.metrics.sync_in_failures.fetch_add(1, Ordering::Relaxed);
							report.statuses.push(FileSyncStatus {
								path: entry.path.clone(),
								ok: false,
								error: Some(e.to_string()),
							});
						}
					}
				}
				Err(e) => {
					self.metrics.sync_in_failures.fetch_add(1, Ordering::Relaxed);
					report.statuses.push(FileSyncStatus {
						path: entry.path.clone(),
						ok: false,
						error: Some(e.to_string()),
					});
				}
			}
		}

		// Unlisted local files are deleted: the object store is authoritative.
		let local_files = walk_local(workspace_host_path).await?;
		for local_rel in local_files {
			if !remote_paths.contains(&local_rel) {
				let full = workspace_host_path.join(&local_rel);
				if tokio::fs::remove_file(&full).await.is_ok() {
					self.metrics.sync_in_deletions.fetch_add(1, Ordering::Relaxed);
				}
			}
		}

		Ok(report)
	}

	/// Sync-out (§4.D): enumerate local files, upload every one that is new
	/// or hash-mismatched against `registry`'s last-known version, bumping
	/// `version`. Local deletions are never propagated (§9 open question,
	/// resolved toward the spec's literal text). Returns the set of records
	/// written, from which the pipeline computes the presented-file set.
	pub async fn sync_out(
		&self,
		tenant: &str,
		conversation_id: &str,
		workspace_host_path: &Path,
		registry: &WorkspaceRegistry,
	) -> CoreResult<(SyncReport, Vec<WorkspaceFileRecord>)> {
		let local_files = walk_local(workspace_host_path).await?;
		let mut report = SyncReport::default();
		let mut written = Vec::new();

		for rel in local_files {
			let full = workspace_host_path.join(&rel);
			let bytes = match tokio::fs::read(&full).await {
				Ok(b) => b,
				Err(e) => {
					self.metrics.sync_out_failures.fetch_add(1, Ordering::Relaxed);
					report.statuses.push(FileSyncStatus {
						path: rel.clone(),
						ok: false,
						error: Some(e.to_string()),
					});
					continue;
				}
			};
			let hash = hex_sha256(&bytes);
			let existing = registry.get(conversation_id, &rel);
			let unchanged = existing
				.as_ref()
				.map(|r| r.content_hash == hash)
				.unwrap_or(false);
			if unchanged {
				continue;
			}

			let mime = mime_guess_for(&rel);
			match self
				.gateway
				.put(tenant, conversation_id, &rel, bytes.clone().into(), &mime)
				.await
			{
				Ok(meta) => {
					let version = existing.as_ref().map(|r| r.version + 1).unwrap_or(1);
					let source = existing.map(|r| r.source).unwrap_or(FileSource::AiCreated);
					let record = WorkspaceFileRecord {
						file_id: Uuid::new_v4(),
						file_path: rel.clone(),
						original_name: rel
							.rsplit('/')
							.next()
							.unwrap_or(&rel)
							.to_string(),
						original_relative_path: rel.clone(),
						size_bytes: meta.size_bytes,
						mime_type: meta.mime_type,
						version,
						source,
						is_presented: false,
						content_hash: meta.content_hash,
					};
					registry.upsert(conversation_id, record.clone());
					self.metrics.sync_out_files.fetch_add(1, Ordering::Relaxed);
					self.metrics
						.sync_out_bytes
						.fetch_add(bytes.len() as u64, Ordering::Relaxed);
					report.statuses.push(FileSyncStatus {
						path: rel,
						ok: true,
						error: None,
					});
					written.push(record);
				}
				Err(e) => {
					self.metrics.sync_out_failures.fetch_add(1, Ordering::Relaxed);
					report.statuses.push(FileSyncStatus {
						path: rel,
						ok: false,
						error: Some(e.to_string()),
					});
				}
			}
		}

		Ok((report, written))
	}
}

/// Presented-file computation (§3 "Presented-file set", §4.D): the files
/// created or modified by this run that were not already user uploads.
pub fn compute_presented_files(
	written_this_run: &[WorkspaceFileRecord],
	pre_run_user_uploads: &HashSet<String>,
) -> HashSet<String> {
	written_this_run
		.iter()
		.filter(|r| !pre_run_user_uploads.contains(&r.file_path))
		.map(|r| r.file_path.clone())
		.collect()
}

async fn local_file_hash(path: &Path) -> Option<String> {
	let bytes = tokio::fs::read(path).await.ok()?;
	Some(hex_sha256(&bytes))
}

fn hex_sha256(data: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hex::encode(hasher.finalize())
}

fn mime_guess_for(path: &str) -> String {
	match path.rsplit('.').next() {
		Some("csv") => "text/csv",
		Some("json") => "application/json",
		Some("txt") => "text/plain",
		Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
		Some("pdf") => "application/pdf",
		Some("png") => "image/png",
		Some("jpg") | Some("jpeg") => "image/jpeg",
		_ => "application/octet-stream",
	}
	.to_string()
}

async fn walk_local(root: &Path) -> CoreResult<Vec<String>> {
	let mut out = Vec::new();
	walk_local_inner(root, root, &mut out).await?;
	Ok(out)
}

fn walk_local_inner<'a>(
	base: &'a Path,
	dir: &'a Path,
	out: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<()>> + Send + 'a>> {
	Box::pin(async move {
		if !dir.exists() {
			return Ok(());
		}
		let mut entries = tokio::fs::read_dir(dir)
			.await
			.map_err(|e| CoreError::infrastructure("workspace_sync_engine", e))?;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| CoreError::infrastructure("workspace_sync_engine", e))?
		{
			let path = entry.path();
			if path.is_dir() {
				walk_local_inner(base, &path, out).await?;
			} else {
				let rel = path
					.strip_prefix(base)
					.unwrap_or(&path)
					.to_string_lossy()
					.replace('\\', "/");
				out.push(rel);
			}
		}
		Ok(())
	})
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::gateway::local_fs::LocalFsGateway;
	use bytes::Bytes;
	use tempfile::tempdir;

	fn registry_with_upload(conv: &str, path: &str, hash: &str) -> WorkspaceRegistry {
		let reg = WorkspaceRegistry::new();
		reg.upsert(
			conv,
			WorkspaceFileRecord {
				file_id: Uuid::new_v4(),
				file_path: path.to_string(),
				original_name: path.to_string(),
				original_relative_path: path.to_string(),
				size_bytes: 5,
				mime_type: "text/csv".to_string(),
				version: 1,
				source: FileSource::UserUpload,
				is_presented: false,
				content_hash: hash.to_string(),
			},
		);
		reg
	}

	#[tokio::test]
	async fn sync_in_downloads_missing_files() {
		let obj_dir = tempdir().unwrap();
		let gw: Arc<dyn ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(obj_dir.path(), "workspaces", 10 * 1024 * 1024));
		gw.put("acme", "c1", "uploads/a.csv", Bytes::from_static(b"hello"), "text/csv")
			.await
			.unwrap();

		let engine = SyncEngine::new(gw, Arc::new(SyncMetrics::default()));
		let bind_dir = tempdir().unwrap();
		let report = engine.sync_in("acme", "c1", bind_dir.path()).await.unwrap();
		assert!(report.all_ok());
		assert!(bind_dir.path().join("uploads/a.csv").exists());
	}

	#[tokio::test]
	async fn sync_in_deletes_local_files_not_present_remotely() {
		let obj_dir = tempdir().unwrap();
		let gw: Arc<dyn ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(obj_dir.path(), "workspaces", 10 * 1024 * 1024));

		let engine = SyncEngine::new(gw, Arc::new(SyncMetrics::default()));
		let bind_dir = tempdir().unwrap();
		tokio::fs::create_dir_all(bind_dir.path().join("stale")).await.unwrap();
		tokio::fs::write(bind_dir.path().join("stale/old.txt"), b"gone").await.unwrap();

		engine.sync_in("acme", "c1", bind_dir.path()).await.unwrap();
		assert!(!bind_dir.path().join("stale/old.txt").exists());
	}

	#[tokio::test]
	async fn sync_in_then_sync_out_with_no_changes_is_a_noop() {
		let obj_dir = tempdir().unwrap();
		let gw: Arc<dyn ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(obj_dir.path(), "workspaces", 10 * 1024 * 1024));
		gw.put("acme", "c1", "uploads/a.csv", Bytes::from_static(b"hello"), "text/csv")
			.await
			.unwrap();

		let hash = {
			let mut h = Sha256::new();
			h.update(b"hello");
			hex::encode(h.finalize())
		};
		let registry = registry_with_upload("c1", "uploads/a.csv", &hash);

		let metrics = Arc::new(SyncMetrics::default());
		let engine = SyncEngine::new(gw, metrics.clone());
		let bind_dir = tempdir().unwrap();
		engine.sync_in("acme", "c1", bind_dir.path()).await.unwrap();

		let (report, written) = engine
			.sync_out("acme", "c1", bind_dir.path(), &registry)
			.await
			.unwrap();
		assert!(report.all_ok());
		assert!(written.is_empty(), "unchanged file must not bump the version");
		assert_eq!(metrics.sync_out_files.load(Ordering::Relaxed), 0);
	}

	#[tokio::test]
	async fn sync_out_uploads_new_ai_created_files() {
		let obj_dir = tempdir().unwrap();
		let gw: Arc<dyn ObjectStoreGateway> =
			Arc::new(LocalFsGateway::new(obj_dir.path(), "workspaces", 10 * 1024 * 1024));
		let engine = SyncEngine::new(gw.clone(), Arc::new(SyncMetrics::default()));
		let bind_dir = tempdir().unwrap();
		tokio::fs::create_dir_all(bind_dir.path().join("outputs")).await.unwrap();
		tokio::fs::write(bind_dir.path().join("outputs/report.xlsx"), b"binary-ish")
			.await
			.unwrap();

		let registry = WorkspaceRegistry::new();
		let (report, written) = engine
			.sync_out("acme", "c1", bind_dir.path(), &registry)
			.await
			.unwrap();
		assert!(report.all_ok());
		assert_eq!(written.len(), 1);
		assert_eq!(written[0].file_path, "outputs/report.xlsx");

		let presented = compute_presented_files(&written, &HashSet::new());
		assert!(presented.contains("outputs/report.xlsx"));
	}
}
