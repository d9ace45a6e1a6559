//! SSE Framer (§4.F): a back-pressured, byte-oriented framer sitting
//! between the agent run pipeline and the HTTP response body. Single
//! writer per client connection; `tool_*`/`result`/`session_start`/`error`
//! frames are delivered with backpressure (the producer awaits channel
//! capacity), while `text_delta`/`thinking` frames collapse under
//! backpressure rather than blocking the agent turn (§4.F).

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One frame: `event: <name>\ndata: <json>\n\n` on the wire (§4.F),
/// carrying a monotonic sequence number for diagnostics.
#[derive(Debug, Clone)]
pub struct SseFrame {
	pub event: &'static str,
	pub data: Value,
	pub seq: u64,
}

/// Producer-side handle held by the agent run pipeline. Cheap to clone;
/// every clone shares the same channel, sequence counter, and
/// dropped-bytes counter.
#[derive(Clone)]
pub struct FramerHandle {
	tx: mpsc::Sender<SseFrame>,
	seq: Arc<AtomicU64>,
	dropped_bytes: Arc<AtomicU64>,
}

/// Construct a framer pair: the producer-side [`FramerHandle`] and the
/// consumer-side channel the HTTP layer turns into an SSE body.
pub fn new_framer(capacity: usize) -> (FramerHandle, mpsc::Receiver<SseFrame>) {
	let (tx, rx) = mpsc::channel(capacity);
	(
		FramerHandle {
			tx,
			seq: Arc::new(AtomicU64::new(0)),
			dropped_bytes: Arc::new(AtomicU64::new(0)),
		},
		rx,
	)
}

impl FramerHandle {
	/// Send a frame that must never be silently dropped: `session_start`,
	/// `tool_use`, `tool_result`, `result`, `error`. Backpressure is
	/// applied by awaiting channel capacity.
	pub async fn send_guaranteed(&self, event: &'static str, data: Value) -> bool {
		let seq = self.seq.fetch_add(1, Ordering::Relaxed);
		self.tx.send(SseFrame { event, data, seq }).await.is_ok()
	}

	/// Send a `text_delta`/`thinking` frame. On a full channel (a slow or
	/// dead client), the frame is collapsed away rather than blocking the
	/// agent turn, and its approximate byte length is added to the
	/// dropped-bytes counter surfaced via observability (§4.F).
	pub fn send_collapsible(&self, event: &'static str, data: Value) {
		let approx_len = data.to_string().len() as u64;
		let seq = self.seq.fetch_add(1, Ordering::Relaxed);
		if self.tx.try_send(SseFrame { event, data, seq }).is_err() {
			self.dropped_bytes.fetch_add(approx_len, Ordering::Relaxed);
		}
	}

	/// Attempt to enqueue a `heartbeat` frame without blocking. Returns
	/// `false` if the channel was full or closed, which the pipeline's
	/// heartbeat ticker counts toward the consecutive-failure limit
	/// (§4.E "3 consecutive heartbeat failures ... aborts the run").
	pub fn try_send_heartbeat(&self) -> bool {
		let seq = self.seq.fetch_add(1, Ordering::Relaxed);
		self.tx
			.try_send(SseFrame {
				event: "heartbeat",
				data: serde_json::json!({}),
				seq,
			})
			.is_ok()
	}

	pub fn dropped_bytes(&self) -> u64 {
		self.dropped_bytes.load(Ordering::Relaxed)
	}
}

/// Adapt the consumer side of a framer into the `Stream` axum's
/// `Sse` response body expects.
pub fn into_axum_stream(
	rx: mpsc::Receiver<SseFrame>,
) -> impl Stream<Item = Result<Event, Infallible>> {
	ReceiverStream::new(rx).map(|frame| {
		Ok(Event::default()
			.event(frame.event)
			.json_data(frame.data)
			.unwrap_or_else(|_| Event::default().event(frame.event).data("{}")))
	})
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn guaranteed_frames_are_never_dropped_under_capacity() {
		let (handle, mut rx) = new_framer(4);
		assert!(handle.send_guaranteed("result", serde_json::json!({"ok": true})).await);
		let frame = rx.recv().await.unwrap();
		assert_eq!(frame.event, "result");
	}

	#[tokio::test]
	async fn collapsible_frames_drop_and_count_bytes_when_full() {
		let (handle, _rx) = new_framer(1);
		handle.send_collapsible("text_delta", serde_json::json!({"content": "a"}));
		// Channel now holds one frame; a second send with no consumer
		// draining exceeds capacity and is collapsed away.
		handle.send_collapsible("text_delta", serde_json::json!({"content": "bbbb"}));
		assert!(handle.dropped_bytes() > 0);
	}

	#[tokio::test]
	async fn heartbeat_try_send_reports_failure_on_full_channel() {
		let (handle, _rx) = new_framer(1);
		assert!(handle.try_send_heartbeat());
		assert!(!handle.try_send_heartbeat());
	}
}
