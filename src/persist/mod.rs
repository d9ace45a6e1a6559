//! Background batcher for run-record persistence (§10.6), mirroring the
//! teacher's `persist::start_batcher` shape: a bounded MPSC channel feeds
//! a single background task that flushes to the repository either when
//! `batch_size` is reached or `flush_interval_ms` elapses.

pub mod repo;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, Sender};
use tokio::time::Duration;

use crate::observability::MetricsRegistry;
use crate::pipeline::RunRecord;
use repo::AuditRepo;

/// A single persistence job. Only run-record upserts flow through the
/// batcher; proxy audit records have their own dedicated MPSC sink
/// (§5 "one producer per connection, MPSC sink") in [`crate::proxy::audit`].
#[derive(Clone, Debug)]
pub enum PersistJob {
	Run(RunRecord),
}

pub type PersistSender = Sender<PersistJob>;

/// Start a background batcher task that collects persistence jobs and
/// flushes them to `repo` either when `batch_size` is reached or when
/// `flush_interval_ms` elapses. Returns the sender used to submit jobs.
pub fn start_batcher(
	repo: Arc<dyn AuditRepo>,
	metrics: Arc<MetricsRegistry>,
	channel_capacity: usize,
	batch_size: usize,
	flush_interval_ms: u64,
) -> PersistSender {
	let (tx, mut rx) = mpsc::channel::<PersistJob>(channel_capacity);

	tokio::spawn(async move {
		let mut buffer: Vec<PersistJob> = Vec::with_capacity(batch_size);
		let flush_interval = Duration::from_millis(flush_interval_ms);

		loop {
			tokio::select! {
				biased;
				maybe_job = rx.recv() => {
					match maybe_job {
						Some(job) => {
							buffer.push(job);
							if buffer.len() >= batch_size {
								flush_buffer(&repo, &metrics, &mut buffer).await;
							}
						}
						None => {
							if !buffer.is_empty() {
								flush_buffer(&repo, &metrics, &mut buffer).await;
							}
							break;
						}
					}
				}
				_ = tokio::time::sleep(flush_interval) => {
					if !buffer.is_empty() {
						flush_buffer(&repo, &metrics, &mut buffer).await;
					}
				}
			}
		}
	});

	tx
}

async fn flush_buffer(repo: &Arc<dyn AuditRepo>, metrics: &Arc<MetricsRegistry>, buffer: &mut Vec<PersistJob>) {
	let jobs: Vec<PersistJob> = buffer.drain(..).collect();
	if jobs.is_empty() {
		return;
	}

	let start = Instant::now();
	metrics.persist_batch_flushes.inc();

	let mut any_failed = false;
	for job in jobs {
		let PersistJob::Run(run) = job;
		if let Err(e) = repo.record_run(&run).await {
			any_failed = true;
			metrics.persist_per_item_failures.inc();
			log::error!("failed to persist run record {}: {}", run.run_id, e);
		}
	}
	if any_failed {
		metrics.persist_batch_failures.inc();
	}

	let elapsed_ms = start.elapsed().as_millis() as f64;
	metrics.persist_batch_latency_ms.observe(elapsed_ms);
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::pipeline::{RunRecord, RunState};
	use repo::test_double::InMemoryAuditRepo;
	use uuid::Uuid;

	fn sample_run() -> RunRecord {
		RunRecord {
			run_id: Uuid::new_v4(),
			conversation_id: "c1".to_string(),
			tenant_id: "acme".to_string(),
			state: RunState::Succeeded,
			started_at: chrono::Utc::now(),
			ended_at: Some(chrono::Utc::now()),
			usage: Default::default(),
			cost_usd: 0.0,
			num_turns: 1,
			error: None,
		}
	}

	#[tokio::test]
	async fn submitted_run_reaches_the_repo() {
		let repo = Arc::new(InMemoryAuditRepo::default());
		let metrics = Arc::new(MetricsRegistry::new());
		let tx = start_batcher(repo.clone(), metrics, 16, 4, 20);
		tx.send(PersistJob::Run(sample_run())).await.unwrap();
		drop(tx);
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		assert_eq!(repo.runs.lock().unwrap().len(), 1);
	}
}
