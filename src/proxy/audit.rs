use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// One audit record per proxy decision (§4.B.2, §3 "Whitelist entry").
/// Never carries credential material — only what was requested and
/// whether it was allowed.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
	pub container_id: String,
	pub host: String,
	pub method: String,
	pub allowed: bool,
	pub timestamp: DateTime<Utc>,
}

pub type AuditSender = Sender<AuditRecord>;

/// MPSC audit sink: one producer per proxy connection, a single consumer
/// draining to the persistence repository (§5 "audit-log append is
/// lock-free (one producer per connection, MPSC sink)"), mirrored on the
/// teacher's `persist::start_batcher` background-task shape.
pub fn start_audit_sink(
	repo: std::sync::Arc<dyn crate::persist::repo::AuditRepo>,
	channel_capacity: usize,
) -> AuditSender {
	let (tx, rx) = mpsc::channel(channel_capacity);
	tokio::spawn(drain(repo, rx));
	tx
}

async fn drain(repo: std::sync::Arc<dyn crate::persist::repo::AuditRepo>, mut rx: Receiver<AuditRecord>) {
	while let Some(record) = rx.recv().await {
		if let Err(e) = repo.record_proxy_audit(&record).await {
			log::error!("failed to persist proxy audit record: {}", e);
		}
	}
}

#[cfg(feature = "proxy-tests")]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	struct CountingRepo {
		count: AtomicUsize,
	}

	#[async_trait]
	impl crate::persist::repo::AuditRepo for CountingRepo {
		async fn ping(&self) -> anyhow::Result<()> {
			Ok(())
		}
		async fn record_run(&self, _run: &crate::pipeline::RunRecord) -> anyhow::Result<()> {
			Ok(())
		}
		async fn record_proxy_audit(&self, _record: &AuditRecord) -> anyhow::Result<()> {
			self.count.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn records_sent_reach_the_repo() {
		let repo = Arc::new(CountingRepo {
			count: AtomicUsize::new(0),
		});
		let tx = start_audit_sink(repo.clone(), 8);
		tx.send(AuditRecord {
			container_id: "c1".to_string(),
			host: "169.254.169.254".to_string(),
			method: "GET".to_string(),
			allowed: false,
			timestamp: Utc::now(),
		})
		.await
		.unwrap();
		drop(tx);
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert_eq!(repo.count.load(Ordering::SeqCst), 1);
	}
}
