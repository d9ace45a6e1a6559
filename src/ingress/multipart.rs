//! `/tenants/{t}/conversations/{c}/stream` and the workspace read views
//! (§6). Parsing and validation only — every decision is delegated to the
//! pipeline, sync engine, and workspace registry.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use log::warn;
use serde::Deserialize;

use crate::errors::{CoreError, CoreResult};
use crate::gateway::normalize_relative_path;
use crate::pipeline::RunRequest;
use crate::sse::new_framer;
use crate::state::AppState;
use crate::sync::{FileSource, WorkspaceFileRecord};

/// One entry of the `file_metadata` JSON array accompanying a `/stream`
/// multipart upload (§6 "File metadata").
#[derive(Debug, Deserialize)]
struct FileUploadMetadata {
	filename: String,
	original_name: String,
	relative_path: String,
	original_relative_path: String,
	content_type: String,
	size: u64,
}

struct ParsedUpload {
	bytes: Bytes,
	meta: FileUploadMetadata,
}

/// `POST /tenants/{t}/conversations/{c}/stream`: accepts `request_data`
/// (JSON), `file_metadata` (JSON array), and one or more `files` fields
/// (order-matched against `file_metadata`), persists uploads, then drives
/// one run to completion while streaming translated SSE events.
pub async fn stream_handler(
	State(state): State<AppState>,
	Path((tenant, conversation)): Path<(String, String)>,
	mut multipart: Multipart,
) -> Response {
	let mut request_data: Option<RunRequest> = None;
	let mut file_metadata: Vec<FileUploadMetadata> = Vec::new();
	let mut file_bytes: Vec<Bytes> = Vec::new();

	loop {
		let field = match multipart.next_field().await {
			Ok(Some(f)) => f,
			Ok(None) => break,
			Err(e) => return CoreError::Validation(format!("malformed multipart body: {e}")).into_response(),
		};

		match field.name().unwrap_or_default() {
			"request_data" => {
				let text = match field.text().await {
					Ok(t) => t,
					Err(e) => return CoreError::Validation(e.to_string()).into_response(),
				};
				request_data = match serde_json::from_str(&text) {
					Ok(v) => Some(v),
					Err(e) => return CoreError::Validation(format!("invalid request_data: {e}")).into_response(),
				};
			}
			"file_metadata" => {
				let text = match field.text().await {
					Ok(t) => t,
					Err(e) => return CoreError::Validation(e.to_string()).into_response(),
				};
				file_metadata = match serde_json::from_str(&text) {
					Ok(v) => v,
					Err(e) => return CoreError::Validation(format!("invalid file_metadata: {e}")).into_response(),
				};
			}
			"files" => {
				let bytes: Bytes = match field.bytes().await {
					Ok(b) => b,
					Err(e) => return CoreError::Validation(e.to_string()).into_response(),
				};
				file_bytes.push(bytes);
			}
			_ => {}
		}
	}

	let Some(request) = request_data else {
		return CoreError::Validation("missing request_data field".to_string()).into_response();
	};

	if file_bytes.len() != file_metadata.len() {
		return CoreError::Validation(format!(
			"{} file(s) uploaded but {} file_metadata entries provided",
			file_bytes.len(),
			file_metadata.len()
		))
		.into_response();
	}

	let uploads: Vec<ParsedUpload> = file_bytes
		.into_iter()
		.zip(file_metadata)
		.map(|(bytes, meta)| ParsedUpload { bytes, meta })
		.collect();

	for upload in uploads {
		if let Err(e) = persist_upload(&state, &tenant, &conversation, upload).await {
			return e.into_response();
		}
	}

	let (sse, rx) = new_framer(256);
	let pipeline = state.pipeline.clone();
	let tenant_owned = tenant.clone();
	let conversation_owned = conversation.clone();
	tokio::spawn(async move {
		pipeline.run(&tenant_owned, &conversation_owned, request, sse).await;
	});

	Sse::new(crate::sse::into_axum_stream(rx)).into_response()
}

async fn persist_upload(
	state: &AppState,
	tenant: &str,
	conversation: &str,
	upload: ParsedUpload,
) -> CoreResult<()> {
	let ParsedUpload { bytes, meta } = upload;

	if meta.size > state.object_size_cap_bytes {
		return Err(CoreError::FileSizeExceeded {
			size_bytes: meta.size,
			cap_bytes: state.object_size_cap_bytes,
		});
	}

	let relative_path = normalize_relative_path(&meta.relative_path)?;
	let existing = state.workspace_registry.get(conversation, &relative_path);

	let object_meta = state
		.gateway
		.put(tenant, conversation, &relative_path, bytes, &meta.content_type)
		.await?;

	let record = WorkspaceFileRecord {
		file_id: uuid::Uuid::new_v4(),
		file_path: relative_path,
		original_name: meta.original_name,
		original_relative_path: meta.original_relative_path,
		size_bytes: object_meta.size_bytes,
		mime_type: object_meta.mime_type,
		version: existing.map(|r| r.version + 1).unwrap_or(1),
		source: FileSource::UserUpload,
		is_presented: false,
		content_hash: object_meta.content_hash,
	};
	// `filename` is caller-generated and carried verbatim on the stored
	// object key; it is not stored separately on the record (§6 "Identifier
	// suffixes in filename/relative_path are caller-generated and preserved").
	let _ = &meta.filename;

	state.workspace_registry.upsert(conversation, record);
	Ok(())
}

pub async fn list_files(
	State(state): State<AppState>,
	Path((_tenant, conversation)): Path<(String, String)>,
) -> axum::Json<Vec<WorkspaceFileRecord>> {
	axum::Json(state.workspace_registry.list(&conversation))
}

pub async fn presented_files(
	State(state): State<AppState>,
	Path((_tenant, conversation)): Path<(String, String)>,
) -> axum::Json<Vec<WorkspaceFileRecord>> {
	axum::Json(state.workspace_registry.presented(&conversation))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
	path: String,
}

/// `GET .../files/download?path=`: rejects traversal with `PATH_TRAVERSAL`
/// before ever touching the gateway (§8 scenario 2).
pub async fn download_file(
	State(state): State<AppState>,
	Path((tenant, conversation)): Path<(String, String)>,
	Query(query): Query<DownloadQuery>,
) -> Response {
	let relative_path = match normalize_relative_path(&query.path) {
		Ok(p) => p,
		Err(e) => return e.into_response(),
	};

	let mime_type = state
		.workspace_registry
		.get(&conversation, &relative_path)
		.map(|r| r.mime_type)
		.unwrap_or_else(|| "application/octet-stream".to_string());

	match state.gateway.get(&tenant, &conversation, &relative_path).await {
		Ok(bytes) => (
			StatusCode::OK,
			[(header::CONTENT_TYPE, mime_type)],
			bytes.to_vec(),
		)
			.into_response(),
		Err(e) => {
			warn!("download failed for {}/{}/{}: {}", tenant, conversation, relative_path, e);
			e.into_response()
		}
	}
}
