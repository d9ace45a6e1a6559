use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Taxonomy of errors surfaced across component boundaries (§7).
///
/// Every variant carries whatever context it needs to render both an SSE
/// `error` payload and an HTTP response without re-deriving it at the call
/// site. Internal library errors (`sqlx`, `std::io`, `hyper`, `reqwest`) are
/// wrapped with `anyhow::Context` inside component internals and converted
/// to the nearest variant here at the component's public boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error("validation error: {0}")]
	Validation(String),

	#[error("authorization denied: {0}")]
	Authorization(String),

	#[error("conversation {conversation_id} is locked by a running run")]
	ConversationLocked { conversation_id: String },

	#[error("duplicate key: {0}")]
	Conflict(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("path traversal rejected: {path}")]
	PathTraversal { path: String },

	#[error("file size exceeded: {size_bytes} bytes (cap {cap_bytes})")]
	FileSizeExceeded { size_bytes: u64, cap_bytes: u64 },

	#[error("infrastructure error in {component}: {source}")]
	Infrastructure {
		component: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("agent SDK error: {0}")]
	Agent(String),

	#[error("operation timed out: {0}")]
	Timeout(String),

	#[error("container crashed: {0}")]
	ContainerCrashed(String),

	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl CoreError {
	/// The stable error code surfaced on SSE `error` events and REST bodies
	/// (§6 "Error codes surfaced on SSE `error` and REST").
	pub fn code(&self) -> &'static str {
		match self {
			CoreError::Validation(_) => "VALIDATION_ERROR",
			CoreError::Authorization(_) => "SECURITY_ERROR",
			CoreError::ConversationLocked { .. } => "CONVERSATION_LOCKED",
			CoreError::Conflict(_) => "CONVERSATION_LOCKED",
			CoreError::NotFound(_) => "NOT_FOUND",
			CoreError::PathTraversal { .. } => "PATH_TRAVERSAL",
			CoreError::FileSizeExceeded { .. } => "FILE_SIZE_EXCEEDED",
			CoreError::Infrastructure { .. } => "SDK_ERROR",
			CoreError::Agent(_) => "SDK_ERROR",
			CoreError::Timeout(_) => "TIMEOUT",
			CoreError::ContainerCrashed(_) => "CONTAINER_CRASHED",
			CoreError::Internal(_) => "INTERNAL_ERROR",
		}
	}

	pub fn status_code(&self) -> StatusCode {
		match self {
			CoreError::Validation(_) => StatusCode::BAD_REQUEST,
			CoreError::Authorization(_) => StatusCode::FORBIDDEN,
			CoreError::ConversationLocked { .. } | CoreError::Conflict(_) => StatusCode::CONFLICT,
			CoreError::NotFound(_) => StatusCode::NOT_FOUND,
			CoreError::PathTraversal { .. } => StatusCode::FORBIDDEN,
			CoreError::FileSizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
			CoreError::Infrastructure { .. } => StatusCode::BAD_GATEWAY,
			CoreError::Agent(_) => StatusCode::OK, // reported mid-stream, never as the HTTP status
			CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
			CoreError::ContainerCrashed(_) => StatusCode::OK,
			CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Render the `{code, message}` payload used by the SSE `error` event
	/// (§4.E) and as the REST error body. Never includes source chains from
	/// `Infrastructure`/`Internal` — those may wrap credential-bearing
	/// reqwest/hyper errors and must not reach the client.
	pub fn to_sse_payload(&self) -> ErrorBody {
		let message = match self {
			CoreError::Infrastructure { component, .. } => {
				format!("infrastructure error in {component}")
			}
			CoreError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		};
		ErrorBody {
			code: self.code(),
			message,
		}
	}

	pub fn infrastructure(component: &'static str, source: impl Into<anyhow::Error>) -> Self {
		CoreError::Infrastructure {
			component,
			source: source.into(),
		}
	}
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
	pub code: &'static str,
	pub message: String,
}

impl IntoResponse for CoreError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		let body = self.to_sse_payload();
		(status, Json(body)).into_response()
	}
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_traversal_maps_to_forbidden_and_code() {
		let e = CoreError::PathTraversal {
			path: "../../etc/passwd".to_string(),
		};
		assert_eq!(e.status_code(), StatusCode::FORBIDDEN);
		assert_eq!(e.code(), "PATH_TRAVERSAL");
	}

	#[test]
	fn conversation_locked_maps_to_409() {
		let e = CoreError::ConversationLocked {
			conversation_id: "c1".to_string(),
		};
		assert_eq!(e.status_code(), StatusCode::CONFLICT);
		assert_eq!(e.code(), "CONVERSATION_LOCKED");
	}

	#[test]
	fn infrastructure_error_never_leaks_source_text() {
		let e = CoreError::infrastructure("gateway", anyhow::anyhow!("AKIA_SECRET_LEAK"));
		let body = e.to_sse_payload();
		assert!(!body.message.contains("AKIA_SECRET_LEAK"));
	}
}
