//! Priority bands and request deadlines.

use std::time::{Duration, Instant};

use crate::error::StoreError;

/// Queue placement for a request.
///
/// Within a band requests drain FIFO; the bands are realized as one FIFO
/// deque each per worker, so placement is O(1) per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
	/// Bypasses the queue entirely: executes inline against the currently
	/// visible value the moment it reaches its executor. Reads at this
	/// priority also skip the read-parallelism budget.
	Now,
	/// Drains ahead of every other band.
	Urgent,
	/// Ahead of normal traffic, behind urgent traffic. Used internally for
	/// transaction publish requests.
	High,
	/// Default band.
	Normal,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Normal
	}
}

/// Per-request deadline policy.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
	/// No deadline.
	Infinite,
	/// Skip the request with [`StoreError::Expired`] if it is dequeued after
	/// `d` has elapsed since insertion.
	Hard(Duration),
	/// `Hard` expiry at dequeue, plus an execution budget of `d` measured
	/// from dequeue: callbacks running past it reply
	/// [`StoreError::TooLong`] and leave the pre-call value in place.
	Break(Duration),
}

impl Default for Timeout {
	fn default() -> Self {
		Self::Hard(Duration::from_millis(5000))
	}
}

impl Timeout {
	/// Admission check at dequeue time. Returns the remaining execution
	/// budget (`Break` only), or `Expired` when the deadline has passed.
	pub(crate) fn admit(&self, inserted_at: Instant) -> Result<Option<Duration>, StoreError> {
		match self {
			Self::Infinite => Ok(None),
			Self::Hard(d) => {
				if inserted_at.elapsed() > *d {
					Err(StoreError::Expired)
				} else {
					Ok(None)
				}
			}
			Self::Break(d) => {
				if inserted_at.elapsed() > *d {
					Err(StoreError::Expired)
				} else {
					Ok(Some(*d))
				}
			}
		}
	}

	/// Wall-clock bound for a transaction's collect phase.
	pub(crate) const fn collect_budget(&self) -> Option<Duration> {
		match self {
			Self::Infinite => None,
			Self::Hard(d) | Self::Break(d) => Some(*d),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn infinite_always_admits() {
		let old = Instant::now() - Duration::from_secs(3600);
		assert!(matches!(Timeout::Infinite.admit(old), Ok(None)));
	}

	#[test]
	fn hard_expires_after_deadline() {
		let t = Timeout::Hard(Duration::from_millis(10));
		assert!(matches!(t.admit(Instant::now()), Ok(None)));
		let stale = Instant::now() - Duration::from_millis(50);
		assert!(matches!(t.admit(stale), Err(StoreError::Expired)));
	}

	#[test]
	fn break_grants_execution_budget() {
		let t = Timeout::Break(Duration::from_millis(80));
		match t.admit(Instant::now()) {
			Ok(Some(budget)) => assert_eq!(budget, Duration::from_millis(80)),
			other => panic!("expected a budget, got {other:?}"),
		}
		let stale = Instant::now() - Duration::from_millis(200);
		assert!(matches!(t.admit(stale), Err(StoreError::Expired)));
	}

	#[test]
	fn collect_budget_mirrors_duration() {
		assert_eq!(Timeout::Infinite.collect_budget(), None);
		assert_eq!(Timeout::Hard(Duration::from_secs(1)).collect_budget(), Some(Duration::from_secs(1)));
		assert_eq!(Timeout::Break(Duration::from_secs(2)).collect_budget(), Some(Duration::from_secs(2)));
	}
}
