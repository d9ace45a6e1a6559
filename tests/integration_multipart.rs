//! Integration test for the workspace upload/list round trip (§8 scenario 1).
//!
//! Drives `ObjectStoreGateway` + `WorkspaceRegistry` together the way
//! `ingress::multipart::persist_upload` does, without standing up a real
//! HTTP server.

use std::sync::Arc;

use agent_substrate::gateway::ObjectStoreGateway;
use agent_substrate::gateway::local_fs::LocalFsGateway;
use agent_substrate::sync::{FileSource, WorkspaceFileRecord, WorkspaceRegistry};
use bytes::Bytes;

#[tokio::test]
async fn upload_then_list_returns_exactly_one_entry() {
	let dir = tempfile::tempdir().unwrap();
	let gateway: Arc<dyn ObjectStoreGateway> =
		Arc::new(LocalFsGateway::new(dir.path(), "workspaces", 10 * 1024 * 1024));
	let registry = WorkspaceRegistry::new();

	let csv = b"field_type,value\ndomain,example.com\nip,192.0.2.1\n";
	let meta = gateway
		.put("acme", "C1", "uploads/data_c3d4.csv", Bytes::copy_from_slice(csv), "text/csv")
		.await
		.unwrap();
	assert_eq!(meta.size_bytes, csv.len() as u64);

	registry.upsert(
		"C1",
		WorkspaceFileRecord {
			file_id: uuid::Uuid::new_v4(),
			file_path: "uploads/data_c3d4.csv".to_string(),
			original_name: "data.csv".to_string(),
			original_relative_path: "uploads/data_c3d4.csv".to_string(),
			size_bytes: meta.size_bytes,
			mime_type: meta.mime_type,
			version: 1,
			source: FileSource::UserUpload,
			is_presented: false,
			content_hash: meta.content_hash,
		},
	);

	let entries = registry.list("C1");
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].file_path, "uploads/data_c3d4.csv");
	assert_eq!(entries[0].size_bytes, csv.len() as u64);
	assert_eq!(entries[0].source, FileSource::UserUpload);

	let roundtrip = gateway.get("acme", "C1", "uploads/data_c3d4.csv").await.unwrap();
	assert_eq!(&roundtrip[..], &csv[..]);
}

#[tokio::test]
async fn download_with_path_traversal_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let gateway: Arc<dyn ObjectStoreGateway> =
		Arc::new(LocalFsGateway::new(dir.path(), "workspaces", 10 * 1024 * 1024));

	let err = gateway.get("acme", "C1", "../../etc/passwd").await.unwrap_err();
	assert_eq!(err.code(), "PATH_TRAVERSAL");
}

#[tokio::test]
async fn put_over_size_cap_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let gateway: Arc<dyn ObjectStoreGateway> = Arc::new(LocalFsGateway::new(dir.path(), "workspaces", 8));

	let err = gateway
		.put("acme", "C1", "uploads/too_big.bin", Bytes::from_static(b"0123456789"), "application/octet-stream")
		.await
		.unwrap_err();
	assert_eq!(err.code(), "FILE_SIZE_EXCEEDED");
}
