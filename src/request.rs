//! Request records and reply plumbing.
//!
//! Callbacks are type-erased at the API boundary: each carries its own typed
//! reply channel inside the closure, while the engine keeps a separate
//! failure notifier so it can report `Expired`/`TooLong`/panics without
//! running the callback. Both sides share a first-reply-wins slot, so a
//! detached overrunning callback can no longer reach a caller that was
//! already told `TooLong`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cell::KeyInfo;
use crate::error::{Result, StoreError};
use crate::multi::KeyStep;
use crate::priority::{Priority, Timeout};

/// Read callback: runs against a snapshot of the value, replies internally.
pub(crate) type ReadFn<V> = Box<dyn FnOnce(Option<V>) + Send>;

/// Update callback: runs with exclusive access to the slot, replies
/// internally.
pub(crate) type WriteFn<V> = Box<dyn FnOnce(&mut Option<V>) + Send>;

/// Failure notifier: delivers the error marker to the caller's reply
/// channel when the callback cannot (or must not) run to completion.
pub(crate) type FailFn = Box<dyn FnOnce(StoreError) + Send>;

/// What a request asks its executor to do.
pub(crate) enum Action<V> {
	/// Read-parallel callback.
	Read(ReadFn<V>),
	/// Serialized update callback.
	Write(WriteFn<V>),
	/// Report `(tag, current value)` to a transaction collector; no
	/// mutation, no blocking.
	Share {
		tag: usize,
		to: mpsc::UnboundedSender<(usize, Option<V>)>,
	},
	/// Report the current value, then hold the key (blocking the executor
	/// mid-request) until the transaction commits a per-key action. A
	/// dropped commit sender means "keep".
	ShareAndWait {
		tag: usize,
		to: mpsc::UnboundedSender<(usize, Option<V>)>,
		commit: oneshot::Receiver<KeyStep<V>>,
	},
}

impl<V> Action<V> {
	pub(crate) const fn is_read(&self) -> bool {
		matches!(self, Self::Read(_))
	}
}

impl<V> fmt::Debug for Action<V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Read(_) => f.write_str("Action::Read(..)"),
			Self::Write(_) => f.write_str("Action::Write(..)"),
			Self::Share { tag, .. } => f.debug_struct("Action::Share").field("tag", tag).finish_non_exhaustive(),
			Self::ShareAndWait { tag, .. } => {
				f.debug_struct("Action::ShareAndWait").field("tag", tag).finish_non_exhaustive()
			}
		}
	}
}

/// A single-key request, consumed exactly once by the engine.
pub(crate) struct Request<K, V> {
	pub key: K,
	pub action: Action<V>,
	pub on_fail: Option<FailFn>,
	pub priority: Priority,
	pub timeout: Timeout,
	pub inserted_at: Instant,
}

impl<K: fmt::Debug, V> fmt::Debug for Request<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Request")
			.field("key", &self.key)
			.field("action", &self.action)
			.field("priority", &self.priority)
			.field("timeout", &self.timeout)
			.field("inserted_at", &self.inserted_at)
			.finish_non_exhaustive()
	}
}

impl<K, V> Request<K, V> {
	/// Delivers an error marker to the caller, if a reply channel exists.
	pub(crate) fn fail(on_fail: Option<FailFn>, err: StoreError) {
		if let Some(f) = on_fail {
			f(err);
		}
	}
}

/// Inline control messages for a live worker, handled at placement.
pub(crate) enum Info {
	/// A read-parallel child finished (budget slot freed).
	Done,
	/// Pin or unpin the worker against idle death.
	DontDie(bool),
	/// Advisory budget update: running readers finish, new spawns respect
	/// the new cap immediately.
	MaxProcesses(usize),
	/// Per-key diagnostics snapshot. The sender is the caller's; a worker
	/// always answers `Some`.
	Inspect(oneshot::Sender<Option<KeyInfo>>),
}

/// Messages routed to a worker. The server counts every send; the worker
/// counts every receive; the idle-death handshake compares the two.
pub(crate) enum WorkerMsg<K, V> {
	Request(Request<K, V>),
	Info(Info),
}

/// First-reply-wins slot shared between a callback and its failure
/// notifier.
pub(crate) struct ReplySlot<T>(Arc<Mutex<Option<oneshot::Sender<Result<T>>>>>);

impl<T> Clone for ReplySlot<T> {
	fn clone(&self) -> Self {
		Self(Arc::clone(&self.0))
	}
}

impl<T: Send + 'static> ReplySlot<T> {
	pub(crate) fn new() -> (Self, oneshot::Receiver<Result<T>>) {
		let (tx, rx) = oneshot::channel();
		(Self(Arc::new(Mutex::new(Some(tx)))), rx)
	}

	/// Sends the reply if no reply has been sent yet.
	pub(crate) fn fulfill(&self, result: Result<T>) {
		if let Some(tx) = self.0.lock().take() {
			let _ = tx.send(result);
		}
	}

	/// The failure half handed to the engine.
	pub(crate) fn into_fail_fn(self) -> FailFn {
		Box::new(move |err| self.fulfill(Err(err)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn first_reply_wins() {
		let (slot, rx) = ReplySlot::<u32>::new();
		slot.fulfill(Ok(1));
		slot.fulfill(Ok(2));
		assert!(matches!(rx.await, Ok(Ok(1))));
	}

	#[tokio::test]
	async fn fail_fn_loses_to_earlier_reply() {
		let (slot, rx) = ReplySlot::<u32>::new();
		let fail = slot.clone().into_fail_fn();
		slot.fulfill(Ok(7));
		fail(StoreError::TooLong);
		assert!(matches!(rx.await, Ok(Ok(7))));
	}

	#[tokio::test]
	async fn fail_fn_delivers_when_first() {
		let (slot, rx) = ReplySlot::<u32>::new();
		let fail = slot.clone().into_fail_fn();
		fail(StoreError::Expired);
		slot.fulfill(Ok(7));
		assert!(matches!(rx.await, Ok(Err(StoreError::Expired))));
	}
}
