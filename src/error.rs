//! Error types for store operations.

use thiserror::Error;

/// Errors replied to individual requests. None of these terminate the store.
#[derive(Debug, Error)]
pub enum StoreError {
	/// The request was dequeued after its hard deadline and was skipped.
	#[error("request expired before execution")]
	Expired,

	/// The callback exceeded its break deadline; execution was abandoned and
	/// the pre-call value kept.
	#[error("callback ran past its execution deadline")]
	TooLong,

	/// The user callback panicked. The panic is contained to the request.
	#[error("callback panicked: {0}")]
	CallbackPanicked(String),

	/// A transaction callback returned the wrong number of update actions.
	#[error("callback returned {got} update actions for {expected} update keys")]
	BadPublish {
		/// Number of keys in the update set.
		expected: usize,
		/// Number of actions the callback returned.
		got: usize,
	},

	/// The same key appeared twice in initial entries or in a transaction
	/// key set.
	#[error("duplicate key: {0}")]
	DuplicateKeys(String),

	/// A worker terminated (or stopped responding) mid-transaction; the
	/// transaction was rolled forward with no state change.
	#[error("worker lost during a transaction")]
	WorkerCrashed,

	/// The store has been stopped; the request was not served.
	#[error("store is shut down")]
	Shutdown,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
