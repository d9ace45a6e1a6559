//! Agent event schema and the SSE mapping table from §4.E.
//!
//! Runtime reflection / duck-typed tool dispatch from the original agent
//! SDK is replaced here by a tagged-variant enum (§9 "Runtime reflection ...
//! is replaced by a tagged-variant event schema").

use serde::Serialize;
use serde_json::Value;

use crate::sync::{FileSource, WorkspaceFileRecord};

/// Six usage counters carried on a run record and the `result` SSE event
/// (§3 "Run record").
#[derive(Debug, Clone, Copy, Default, Serialize, serde::Deserialize)]
pub struct UsageCounters {
	pub input: u64,
	pub output: u64,
	pub cache_create_5m: u64,
	pub cache_create_1h: u64,
	pub cache_read: u64,
	pub total: u64,
}

/// Events emitted by the agent SDK during `executing` (§4.E table, left
/// column). The agent SDK's internals are out of scope (§1); this is only
/// the boundary shape the pipeline consumes.
#[derive(Debug, Clone)]
pub enum AgentEvent {
	SessionBegin {
		session_id: String,
	},
	PartialText {
		content: String,
	},
	ReasoningTrace {
		content: String,
	},
	ToolCall {
		tool_use_id: String,
		tool_name: String,
		tool_input: Value,
	},
	ToolResult {
		tool_use_id: String,
		result: Value,
		is_error: bool,
	},
	Completion {
		subtype: String,
		result: Value,
		usage: UsageCounters,
		cost_usd: f64,
		num_turns: u32,
		duration_ms: u64,
	},
	Fatal {
		code: String,
		message: String,
	},
}

/// File inventory entry included in the augmented system prompt built at
/// `preparing` (§4.E "build augmented system prompt containing workspace
/// path and file inventory").
#[derive(Debug, Clone, Serialize)]
pub struct FileInventoryEntry {
	pub path: String,
	pub size_bytes: u64,
	pub source: FileSource,
}

impl From<&WorkspaceFileRecord> for FileInventoryEntry {
	fn from(r: &WorkspaceFileRecord) -> Self {
		Self {
			path: r.file_path.clone(),
			size_bytes: r.size_bytes,
			source: r.source,
		}
	}
}

/// Context handed to the agent client for one turn: the workspace path
/// inside the container, the file inventory, and the caller's input.
#[derive(Debug, Clone)]
pub struct AgentTurnContext {
	pub conversation_id: String,
	pub workspace_container_path: String,
	pub file_inventory: Vec<FileInventoryEntry>,
	pub user_input: String,
	pub proxy_socket_path: std::path::PathBuf,
}

/// The augmented system prompt described in §4.E, built once per run at
/// `preparing` from the workspace path and file inventory.
pub fn build_augmented_system_prompt(ctx: &AgentTurnContext) -> String {
	let mut prompt = format!(
		"Workspace directory: {}\nFiles available in the workspace:\n",
		ctx.workspace_container_path
	);
	if ctx.file_inventory.is_empty() {
		prompt.push_str("(workspace is empty)\n");
	} else {
		for entry in &ctx.file_inventory {
			let source = match entry.source {
				FileSource::UserUpload => "user_upload",
				FileSource::AiCreated => "ai_created",
			};
			prompt.push_str(&format!(
				"- {} ({} bytes, {})\n",
				entry.path, entry.size_bytes, source
			));
		}
	}
	prompt
}
