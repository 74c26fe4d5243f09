//! Spawn helpers and drop-guards shared by the engine's task kinds.

use std::future::Future;

use tokio::task::JoinHandle;

/// Classification of the engine's spawned tasks, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
	/// The central routing loop.
	Server,
	/// A per-key executor.
	Worker,
	/// A read-parallel child bound to a value snapshot.
	Reader,
	/// A callback running off-loop under a break deadline.
	Callback,
	/// A multi-key transaction orchestrator.
	Coordinator,
}

impl TaskKind {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Server => "server",
			Self::Worker => "worker",
			Self::Reader => "reader",
			Self::Callback => "callback",
			Self::Coordinator => "coordinator",
		}
	}
}

/// Spawns an engine task with kind metadata.
pub(crate) fn spawn<F>(kind: TaskKind, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(kind = kind.as_str(), "store.spawn");
	tokio::spawn(fut)
}

/// Drop guard that runs a closure on drop regardless of exit path
/// (normal return, panic unwind, or future cancellation/abort).
pub(crate) struct Defer(Option<Box<dyn FnOnce() + Send>>);

impl Defer {
	pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
		Self(Some(Box::new(f)))
	}

	/// Defuses the guard; the closure will not run.
	pub(crate) fn disarm(&mut self) {
		self.0 = None;
	}
}

impl Drop for Defer {
	fn drop(&mut self) {
		if let Some(f) = self.0.take() {
			f();
		}
	}
}

/// Renders a panic payload for error replies and logs.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn defer_runs_on_drop() {
		let hits = Arc::new(AtomicUsize::new(0));
		let hits2 = Arc::clone(&hits);
		drop(Defer::new(move || {
			hits2.fetch_add(1, Ordering::SeqCst);
		}));
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn disarmed_defer_is_silent() {
		let hits = Arc::new(AtomicUsize::new(0));
		let hits2 = Arc::clone(&hits);
		let mut guard = Defer::new(move || {
			hits2.fetch_add(1, Ordering::SeqCst);
		});
		guard.disarm();
		drop(guard);
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn defer_runs_on_unwind() {
		let hits = Arc::new(AtomicUsize::new(0));
		let hits2 = Arc::clone(&hits);
		let result = std::panic::catch_unwind(move || {
			let _guard = Defer::new(move || {
				hits2.fetch_add(1, Ordering::SeqCst);
			});
			panic!("boom");
		});
		assert!(result.is_err());
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn panic_message_renders_common_payloads() {
		let s: Box<dyn std::any::Any + Send> = Box::new("static str");
		assert_eq!(panic_message(s.as_ref()), "static str");
		let s: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
		assert_eq!(panic_message(s.as_ref()), "owned");
		let s: Box<dyn std::any::Any + Send> = Box::new(17u32);
		assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
	}
}
