//! Keyed concurrent state store.
//!
//! A process-local, in-memory map from keys to values where each key is
//! guarded by its own logical execution context. Updates serialize per key,
//! reads fan out in parallel up to a per-key budget, and keys stay
//! independent of each other except within multi-key transactions, which
//! see and publish a consistent per-key snapshot.
//!
//! # Shape
//!
//! - A central **server** task owns the key → state routing map. Keys with
//!   no live worker park their state in a small cell; reads against a cell
//!   run directly on spawned tasks.
//! - The first request a cell cannot serve promotes the key to a
//!   **worker** task with a priority-banded mailbox. Idle workers
//!   negotiate their death with the server and surrender their state back
//!   to a cell.
//! - **Transactions** hold their get-and-update keys mid-request while a
//!   coordinator collects the snapshot, runs the callback, and publishes
//!   per-key actions.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::new([("hits", 0u64)])?;
//! store.get_and_update("hits", |slot| {
//!     *slot = Some(slot.unwrap_or(0) + 1);
//! }).await?;
//! let hits = store.fetch("hits").await?;
//! ```

mod cell;
mod error;
mod multi;
mod priority;
mod request;
mod server;
mod store;
mod task;
mod worker;

pub use cell::KeyInfo;
pub use error::{Result, StoreError};
pub use multi::{KeyStep, Multi, Publish};
pub use priority::{Priority, Timeout};
pub use store::{CallOpts, Store, StoreBuilder, UNBOUNDED};
