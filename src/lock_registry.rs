use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide, non-blocking conversation serialization (§4.G).
///
/// `try_acquire` never waits on a queue: a conversation already running a
/// turn returns `None` immediately and the caller surfaces
/// `CONVERSATION_LOCKED` rather than enqueueing. The returned [`LockGuard`]
/// releases on `Drop`, so a panicking task still frees the slot.
#[derive(Clone, Default)]
pub struct ConversationLockRegistry {
	held: Arc<DashMap<String, ()>>,
}

impl ConversationLockRegistry {
	pub fn new() -> Self {
		Self {
			held: Arc::new(DashMap::new()),
		}
	}

	/// Attempt to acquire the lock for `conversation_id`. Returns `None` if
	/// another run already holds it.
	pub fn try_acquire(&self, conversation_id: &str) -> Option<LockGuard> {
		match self.held.entry(conversation_id.to_string()) {
			dashmap::mapref::entry::Entry::Occupied(_) => None,
			dashmap::mapref::entry::Entry::Vacant(v) => {
				v.insert(());
				Some(LockGuard {
					held: self.held.clone(),
					conversation_id: conversation_id.to_string(),
				})
			}
		}
	}

	pub fn is_locked(&self, conversation_id: &str) -> bool {
		self.held.contains_key(conversation_id)
	}
}

/// RAII guard releasing the conversation lock when dropped, including on
/// an unwinding panic, so a single stuck task can never wedge a
/// conversation permanently (§4.G).
pub struct LockGuard {
	held: Arc<DashMap<String, ()>>,
	conversation_id: String,
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		self.held.remove(&self.conversation_id);
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn second_acquire_for_same_conversation_fails() {
		let reg = ConversationLockRegistry::new();
		let g1 = reg.try_acquire("c1");
		assert!(g1.is_some());
		assert!(reg.try_acquire("c1").is_none());
	}

	#[test]
	fn different_conversations_are_independent() {
		let reg = ConversationLockRegistry::new();
		let _g1 = reg.try_acquire("c1").unwrap();
		assert!(reg.try_acquire("c2").is_some());
	}

	#[test]
	fn drop_releases_the_lock() {
		let reg = ConversationLockRegistry::new();
		{
			let _g = reg.try_acquire("c1").unwrap();
			assert!(reg.is_locked("c1"));
		}
		assert!(!reg.is_locked("c1"));
	}

	#[test]
	fn drop_releases_even_on_panic() {
		let reg = ConversationLockRegistry::new();
		let reg2 = reg.clone();
		let result = std::panic::catch_unwind(move || {
			let _g = reg2.try_acquire("c1").unwrap();
			panic!("simulated task panic while holding the lock");
		});
		assert!(result.is_err());
		assert!(!reg.is_locked("c1"));
	}
}
