use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::{ObjectEntry, ObjectMeta, ObjectStoreGateway, normalize_relative_path, object_key};
use crate::errors::{CoreError, CoreResult};

/// Filesystem-backed gateway used by integration tests and local
/// development in place of a real S3-compatible endpoint. Mirrors the
/// `ObjectStoreGateway` contract exactly so pipeline/sync tests can run
/// without network access.
pub struct LocalFsGateway {
	root: PathBuf,
	prefix: String,
	size_cap_bytes: u64,
}

impl LocalFsGateway {
	pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>, size_cap_bytes: u64) -> Self {
		Self {
			root: root.into(),
			prefix: prefix.into(),
			size_cap_bytes,
		}
	}

	fn full_path(&self, tenant: &str, conv: &str, rel: &str) -> PathBuf {
		self.root.join(object_key(&self.prefix, tenant, conv, rel))
	}
}

fn content_hash(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

#[async_trait]
impl ObjectStoreGateway for LocalFsGateway {
	async fn put(
		&self,
		tenant: &str,
		conv: &str,
		path: &str,
		bytes: Bytes,
		mime: &str,
	) -> CoreResult<ObjectMeta> {
		let rel = normalize_relative_path(path)?;
		if bytes.len() as u64 > self.size_cap_bytes {
			return Err(CoreError::FileSizeExceeded {
				size_bytes: bytes.len() as u64,
				cap_bytes: self.size_cap_bytes,
			});
		}
		let full = self.full_path(tenant, conv, &rel);
		if let Some(parent) = full.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| CoreError::infrastructure("object_store_gateway", e))?;
		}
		fs::write(&full, &bytes)
			.await
			.map_err(|e| CoreError::infrastructure("object_store_gateway", e))?;

		Ok(ObjectMeta {
			path: rel,
			size_bytes: bytes.len() as u64,
			mime_type: mime.to_string(),
			content_hash: content_hash(&bytes),
		})
	}

	async fn get(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<Bytes> {
		let rel = normalize_relative_path(path)?;
		let full = self.full_path(tenant, conv, &rel);
		match fs::read(&full).await {
			Ok(data) => Ok(Bytes::from(data)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::NotFound(rel)),
			Err(e) => Err(CoreError::infrastructure("object_store_gateway", e)),
		}
	}

	async fn delete(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<()> {
		let rel = normalize_relative_path(path)?;
		let full = self.full_path(tenant, conv, &rel);
		match fs::remove_file(&full).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(CoreError::infrastructure("object_store_gateway", e)),
		}
	}

	async fn list(&self, tenant: &str, conv: &str, prefix: &str) -> CoreResult<Vec<ObjectEntry>> {
		let rel_prefix = if prefix.is_empty() {
			String::new()
		} else {
			normalize_relative_path(prefix)?
		};
		let base = self.root.join(object_key(&self.prefix, tenant, conv, ""));
		let mut out = Vec::new();
		walk(&base, &base, &rel_prefix, &mut out).await?;
		Ok(out)
	}

	async fn head(&self, tenant: &str, conv: &str, path: &str) -> CoreResult<Option<ObjectMeta>> {
		let rel = normalize_relative_path(path)?;
		let full = self.full_path(tenant, conv, &rel);
		match fs::read(&full).await {
			Ok(data) => Ok(Some(ObjectMeta {
				path: rel,
				size_bytes: data.len() as u64,
				mime_type: "application/octet-stream".to_string(),
				content_hash: content_hash(&data),
			})),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(CoreError::infrastructure("object_store_gateway", e)),
		}
	}
}

fn walk<'a>(
	base: &'a std::path::Path,
	dir: &'a std::path::Path,
	rel_prefix: &'a str,
	out: &'a mut Vec<ObjectEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<()>> + Send + 'a>> {
	Box::pin(async move {
		if !dir.exists() {
			return Ok(());
		}
		let mut entries = fs::read_dir(dir)
			.await
			.map_err(|e| CoreError::infrastructure("object_store_gateway", e))?;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| CoreError::infrastructure("object_store_gateway", e))?
		{
			let path = entry.path();
			if path.is_dir() {
				walk(base, &path, rel_prefix, out).await?;
			} else {
				let rel = path
					.strip_prefix(base)
					.unwrap_or(&path)
					.to_string_lossy()
					.replace('\\', "/");
				if rel.starts_with(rel_prefix) {
					let data = fs::read(&path)
						.await
						.map_err(|e| CoreError::infrastructure("object_store_gateway", e))?;
					out.push(ObjectEntry {
						path: rel,
						size_bytes: data.len() as u64,
						content_hash: content_hash(&data),
					});
				}
			}
		}
		Ok(())
	})
}

#[cfg(feature = "integration-tests")]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn put_then_get_is_byte_identical() {
		let dir = tempdir().unwrap();
		let gw = LocalFsGateway::new(dir.path(), "workspaces", 1024 * 1024);
		gw.put("acme", "c1", "uploads/data.csv", Bytes::from_static(b"hello"), "text/csv")
			.await
			.unwrap();
		let got = gw.get("acme", "c1", "uploads/data.csv").await.unwrap();
		assert_eq!(&got[..], b"hello");
	}

	#[tokio::test]
	async fn list_reflects_nested_uploads() {
		let dir = tempdir().unwrap();
		let gw = LocalFsGateway::new(dir.path(), "workspaces", 1024 * 1024);
		gw.put("acme", "c1", "uploads/a.csv", Bytes::from_static(b"a"), "text/csv")
			.await
			.unwrap();
		gw.put("acme", "c1", "outputs/report.xlsx", Bytes::from_static(b"b"), "application/xlsx")
			.await
			.unwrap();
		let entries = gw.list("acme", "c1", "").await.unwrap();
		assert_eq!(entries.len(), 2);
	}

	#[tokio::test]
	async fn rejects_traversal_on_put() {
		let dir = tempdir().unwrap();
		let gw = LocalFsGateway::new(dir.path(), "workspaces", 1024 * 1024);
		let res = gw
			.put("acme", "c1", "../../etc/passwd", Bytes::from_static(b"x"), "text/plain")
			.await;
		assert!(res.is_err());
	}
}
