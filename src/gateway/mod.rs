pub mod local_fs;
pub mod resilient_http;
pub mod s3;

pub use s3::S3Gateway;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::errors::{CoreError, CoreResult};

/// One entry returned by [`ObjectStoreGateway::list`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ObjectEntry {
	pub path: String,
	pub size_bytes: u64,
	pub content_hash: String,
}

/// Metadata returned by [`ObjectStoreGateway::head`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ObjectMeta {
	pub path: String,
	pub size_bytes: u64,
	pub mime_type: String,
	pub content_hash: String,
}

/// Thin, typed operations over a remote blob store keyed by
/// `tenant/conversation/path` (§4.A). Implementations must reject paths that
/// escape the conversation root and enforce the per-file size cap on `put`.
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync + 'static {
	async fn put(
		&self,
		tenant: &str,
		conv: &str,
		path: &str,
		bytes: Bytes,
		mime: &str,
	) -> CoreResult<ObjectMeta>;

	async fn get(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<Bytes>;

	async fn delete(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<()>;

	async fn list(&self, tenant: &str, conv: &str, prefix: &str) -> CoreResult<Vec<ObjectEntry>>;

	async fn head(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<Option<ObjectMeta>>;
}

/// Normalize a caller-supplied relative path and reject traversal.
///
/// Rejects absolute paths and any `..` component, per §4.A/§4.D's
/// `PATH_TRAVERSAL` invariant. Returns the path with redundant `.`
/// components and repeated slashes collapsed.
pub fn normalize_relative_path(path: &str) -> CoreResult<String> {
	if path.starts_with('/') || path.starts_with('\\') {
		return Err(CoreError::PathTraversal {
			path: path.to_string(),
		});
	}

	let mut out: Vec<&str> = Vec::new();
	for component in path.split(['/', '\\']) {
		match component {
			"" | "." => continue,
			".." => {
				return Err(CoreError::PathTraversal {
					path: path.to_string(),
				});
			}
			other => out.push(other),
		}
	}

	if out.is_empty() {
		return Err(CoreError::Validation(
			"empty path after normalization".to_string(),
		));
	}

	Ok(out.join("/"))
}

/// Build the storage key `${prefix}/${tenant}/${conv}/${path}` (§4.A, §6).
pub fn object_key(prefix: &str, tenant: &str, conv: &str, path: &str) -> String {
	format!("{}/{}/{}/{}", prefix, tenant, conv, path)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn rejects_absolute_paths() {
		assert!(normalize_relative_path("/etc/passwd").is_err());
	}

	#[test]
	fn rejects_dotdot_traversal() {
		assert!(normalize_relative_path("../../etc/passwd").is_err());
		assert!(normalize_relative_path("a/../../b").is_err());
	}

	#[test]
	fn collapses_redundant_components() {
		let p = normalize_relative_path("a//./b/./c").unwrap();
		assert_eq!(p, "a/b/c");
	}

	#[test]
	fn preserves_identifier_suffixed_names_verbatim() {
		let p = normalize_relative_path("a/b/route_abcd.ts").unwrap();
		assert_eq!(p, "a/b/route_abcd.ts");
	}

	#[test]
	fn builds_expected_key_shape() {
		let k = object_key("workspaces", "acme", "conv-1", "uploads/data_c3d4.csv");
		assert_eq!(k, "workspaces/acme/conv-1/uploads/data_c3d4.csv");
	}
}
