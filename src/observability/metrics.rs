use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics exposed at `GET /metrics`
/// (§10.2). Counters are grouped by the component that owns them; the
/// sync engine and proxy additionally expose their own atomic counters
/// (see [`crate::sync::SyncMetrics`]) composed into the same response
/// text rather than registered here, mirroring how the teacher composed
/// its persistence batcher metrics with the Prometheus registry.
pub struct MetricsRegistry {
	registry: Registry,

	// Agent run pipeline (§4.E)
	pub runs_started_total: IntCounter,
	pub runs_by_terminal_state: IntCounterVec,
	pub run_duration_seconds: Histogram,
	pub conversation_locked_total: IntCounter,

	// SSE framer (§4.F)
	pub sse_heartbeat_failures_total: IntCounter,
	pub sse_dropped_text_delta_bytes_total: IntCounter,

	// Container orchestrator (§4.C)
	pub containers_acquired_total: IntCounter,
	pub containers_reaped_total: IntCounter,
	pub containers_recovered_total: IntCounter,
	pub active_containers: IntGauge,

	// Credential-injection proxy (§4.B)
	pub proxy_requests_allowed_total: IntCounter,
	pub proxy_requests_denied_total: IntCounter,

	// Run/audit persistence (§10.6)
	pub persist_jobs_submitted: IntCounter,
	pub persist_batch_flushes: IntCounter,
	pub persist_batch_failures: IntCounter,
	pub persist_per_item_failures: IntCounter,
	pub persist_batch_latency_ms: Histogram,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let runs_started_total = int_counter(
			"agent_substrate_runs_started_total",
			"Total agent runs started",
		);
		let runs_by_terminal_state = IntCounterVec::new(
			Opts::new(
				"agent_substrate_runs_terminal_total",
				"Agent runs by terminal state",
			)
			.namespace("agent_substrate"),
			&["state"],
		)
		.unwrap();
		let run_duration_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"agent_substrate_run_duration_seconds",
				"Wall-clock duration of a run from queued to terminal",
			)
			.namespace("agent_substrate")
			.buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
		)
		.unwrap();
		let conversation_locked_total = int_counter(
			"agent_substrate_conversation_locked_total",
			"Run attempts rejected because the conversation already had a run in flight",
		);

		let sse_heartbeat_failures_total = int_counter(
			"agent_substrate_sse_heartbeat_failures_total",
			"Consecutive heartbeat write failures observed across all streams",
		);
		let sse_dropped_text_delta_bytes_total = int_counter(
			"agent_substrate_sse_dropped_text_delta_bytes_total",
			"Bytes of text_delta payloads collapsed due to a slow client",
		);

		let containers_acquired_total = int_counter(
			"agent_substrate_containers_acquired_total",
			"Total container acquisitions (pool hit or fresh start)",
		);
		let containers_reaped_total = int_counter(
			"agent_substrate_containers_reaped_total",
			"Total containers destroyed by idle-TTL or failed health probe",
		);
		let containers_recovered_total = int_counter(
			"agent_substrate_containers_recovered_total",
			"Total crash-recovery cycles performed",
		);
		let active_containers = IntGauge::with_opts(
			Opts::new(
				"agent_substrate_active_containers",
				"Containers currently allocated to a running conversation",
			)
			.namespace("agent_substrate"),
		)
		.unwrap();

		let proxy_requests_allowed_total = int_counter(
			"agent_substrate_proxy_requests_allowed_total",
			"Proxied requests approved by the whitelist",
		);
		let proxy_requests_denied_total = int_counter(
			"agent_substrate_proxy_requests_denied_total",
			"Proxied requests denied by the whitelist",
		);

		let persist_jobs_submitted = int_counter(
			"agent_substrate_persist_jobs_submitted_total",
			"Total run/audit records submitted to the persistence batcher",
		);
		let persist_batch_flushes = int_counter(
			"agent_substrate_persist_batch_flushes_total",
			"Number of persistence batch flushes",
		);
		let persist_batch_failures = int_counter(
			"agent_substrate_persist_batch_failures_total",
			"Number of persistence batch flush failures",
		);
		let persist_per_item_failures = int_counter(
			"agent_substrate_persist_per_item_failures_total",
			"Per-record persistence failures after a batch fallback",
		);
		let persist_batch_latency_ms = Histogram::with_opts(
			HistogramOpts::new(
				"agent_substrate_persist_batch_latency_ms",
				"Persistence batch flush latency in milliseconds",
			)
			.namespace("agent_substrate")
			.buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
		)
		.unwrap();

		for metric in [
			Box::new(runs_started_total.clone()) as Box<dyn prometheus::core::Collector>,
			Box::new(runs_by_terminal_state.clone()),
			Box::new(run_duration_seconds.clone()),
			Box::new(conversation_locked_total.clone()),
			Box::new(sse_heartbeat_failures_total.clone()),
			Box::new(sse_dropped_text_delta_bytes_total.clone()),
			Box::new(containers_acquired_total.clone()),
			Box::new(containers_reaped_total.clone()),
			Box::new(containers_recovered_total.clone()),
			Box::new(active_containers.clone()),
			Box::new(proxy_requests_allowed_total.clone()),
			Box::new(proxy_requests_denied_total.clone()),
			Box::new(persist_jobs_submitted.clone()),
			Box::new(persist_batch_flushes.clone()),
			Box::new(persist_batch_failures.clone()),
			Box::new(persist_per_item_failures.clone()),
			Box::new(persist_batch_latency_ms.clone()),
		] {
			registry.register(metric).unwrap();
		}

		Self {
			registry,
			runs_started_total,
			runs_by_terminal_state,
			run_duration_seconds,
			conversation_locked_total,
			sse_heartbeat_failures_total,
			sse_dropped_text_delta_bytes_total,
			containers_acquired_total,
			containers_reaped_total,
			containers_recovered_total,
			active_containers,
			proxy_requests_allowed_total,
			proxy_requests_denied_total,
			persist_jobs_submitted,
			persist_batch_flushes,
			persist_batch_failures,
			persist_per_item_failures,
			persist_batch_latency_ms,
		}
	}

	/// Encode metrics in Prometheus text format.
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				eprintln!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

fn int_counter(name: &'static str, help: &'static str) -> IntCounter {
	IntCounter::with_opts(Opts::new(name, help).namespace("agent_substrate")).unwrap()
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry.
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new();
		assert!(!registry.encode().is_empty());
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new();
		registry.runs_started_total.inc();
		registry
			.runs_by_terminal_state
			.with_label_values(&["succeeded"])
			.inc();
		assert!(!registry.encode().is_empty());
	}
}
