use std::collections::VecDeque;

use super::ContainerDescriptor;

/// Warm pool of idle containers kept between runs (§3 "Lifecycle",
/// §4.C "preferring a warm-pool entry bound to this conversation"). A
/// container's `conversation_id` is immutable, so the pool never
/// reassigns an entry to a different conversation — it only shortens the
/// gap between two runs of the *same* conversation before `idle_ttl`
/// reaps it.
#[derive(Default)]
pub struct WarmPool {
	entries: VecDeque<ContainerDescriptor>,
	capacity: usize,
}

impl WarmPool {
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: VecDeque::with_capacity(capacity),
			capacity,
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn has_capacity(&self) -> bool {
		self.entries.len() < self.capacity
	}

	/// Remove and return the pooled entry for `conversation_id`, if any.
	pub fn take(&mut self, conversation_id: &str) -> Option<ContainerDescriptor> {
		let idx = self
			.entries
			.iter()
			.position(|d| d.conversation_id == conversation_id)?;
		self.entries.remove(idx)
	}

	/// Park `descriptor` in the pool. Caller must have already checked
	/// [`Self::has_capacity`].
	pub fn park(&mut self, descriptor: ContainerDescriptor) {
		self.entries.push_back(descriptor);
	}

	/// Remove and return every entry whose idle duration has exceeded
	/// `idle_ttl`, or for which `is_expired` (a health-probe driven
	/// predicate) returns true.
	pub fn drain_expired(
		&mut self,
		mut is_expired: impl FnMut(&ContainerDescriptor) -> bool,
	) -> Vec<ContainerDescriptor> {
		let mut expired = Vec::new();
		let mut kept = VecDeque::with_capacity(self.entries.len());
		for entry in self.entries.drain(..) {
			if is_expired(&entry) {
				expired.push(entry);
			} else {
				kept.push_back(entry);
			}
		}
		self.entries = kept;
		expired
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::orchestrator::ContainerState;
	use std::time::Instant;

	fn descriptor(conv: &str) -> ContainerDescriptor {
		ContainerDescriptor {
			container_id: format!("c-{conv}"),
			conversation_id: conv.to_string(),
			proxy_socket_path: format!("/sock/{conv}.sock").into(),
			workspace_host_path: format!("/ws/{conv}").into(),
			created_at: Instant::now(),
			state: ContainerState::Allocated,
			last_activity_at: Instant::now(),
			run_count: 0,
		}
	}

	#[test]
	fn take_only_matches_same_conversation() {
		let mut pool = WarmPool::new(4);
		pool.park(descriptor("c1"));
		assert!(pool.take("c2").is_none());
		assert!(pool.take("c1").is_some());
		assert!(pool.is_empty());
	}

	#[test]
	fn has_capacity_respects_bound() {
		let mut pool = WarmPool::new(1);
		assert!(pool.has_capacity());
		pool.park(descriptor("c1"));
		assert!(!pool.has_capacity());
	}

	#[test]
	fn drain_expired_keeps_non_matching_entries() {
		let mut pool = WarmPool::new(4);
		pool.park(descriptor("c1"));
		pool.park(descriptor("c2"));
		let expired = pool.drain_expired(|d| d.conversation_id == "c1");
		assert_eq!(expired.len(), 1);
		assert_eq!(pool.len(), 1);
	}
}
