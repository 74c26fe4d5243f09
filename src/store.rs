//! Public store handle and per-call options.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cell::{Cell, KeyInfo};
use crate::error::{Result, StoreError};
use crate::multi::{Multi, Publish};
use crate::priority::{Priority, Timeout};
use crate::request::{Action, ReplySlot, Request};
use crate::server::{self, Defaults, ServerMsg};

/// Per-key read-parallelism budget value meaning "no bound".
pub const UNBOUNDED: usize = usize::MAX;

/// Priority and deadline for one call.
#[derive(Debug, Clone, Copy)]
pub struct CallOpts {
	pub priority: Priority,
	pub timeout: Timeout,
}

impl Default for CallOpts {
	fn default() -> Self {
		Self {
			priority: Priority::Normal,
			timeout: Timeout::default(),
		}
	}
}

impl CallOpts {
	/// Shorthand for the urgent band.
	pub fn urgent() -> Self {
		Self::default().priority(Priority::Urgent)
	}

	/// Shorthand for queue-bypassing execution.
	pub fn now() -> Self {
		Self::default().priority(Priority::Now)
	}

	pub const fn priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	pub const fn timeout(mut self, timeout: Timeout) -> Self {
		self.timeout = timeout;
		self
	}
}

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreBuilder {
	name: String,
	max_processes: usize,
	idle_wait: Duration,
}

impl Default for StoreBuilder {
	fn default() -> Self {
		Self {
			name: "cellmap".to_string(),
			max_processes: 5,
			idle_wait: Duration::from_millis(100),
		}
	}
}

impl StoreBuilder {
	/// Name used in tracing fields.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Default per-key read-parallelism budget ([`UNBOUNDED`] for none).
	pub fn max_processes(mut self, max_processes: usize) -> Self {
		self.max_processes = max_processes;
		self
	}

	/// How long a worker with drained queues waits before asking to die.
	pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
		self.idle_wait = idle_wait;
		self
	}

	/// Validates the initial entries and spawns the store.
	///
	/// Must be called within a Tokio runtime. Fails with
	/// [`StoreError::DuplicateKeys`] when `initial` repeats a key.
	pub fn build<K, V>(self, initial: impl IntoIterator<Item = (K, V)>) -> Result<Store<K, V>>
	where
		K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
		V: Clone + Send + 'static,
	{
		let mut cells = HashMap::new();
		for (key, value) in initial {
			if cells.insert(key.clone(), Cell::with_value(value, self.max_processes)).is_some() {
				return Err(StoreError::DuplicateKeys(format!("{key:?}")));
			}
		}
		let cancel = CancellationToken::new();
		let tx = server::spawn(
			cells,
			Defaults {
				name: Arc::from(self.name.as_str()),
				max_processes: self.max_processes,
				idle_wait: self.idle_wait,
			},
			cancel.clone(),
		);
		Ok(Store { tx, cancel })
	}
}

/// Handle to a keyed concurrent state store.
///
/// Cloning is cheap; all clones address the same store. Reads fan out up to
/// each key's parallelism budget, updates serialize per key, and keys are
/// independent of each other except within a transaction.
#[derive(Debug)]
pub struct Store<K, V> {
	tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
	cancel: CancellationToken,
}

impl<K, V> Clone for Store<K, V> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
			cancel: self.cancel.clone(),
		}
	}
}

impl Store<(), ()> {
	pub fn builder() -> StoreBuilder {
		StoreBuilder::default()
	}
}

impl<K, V> Store<K, V>
where
	K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
{
	/// A store with default options over the given entries.
	pub fn new(initial: impl IntoIterator<Item = (K, V)>) -> Result<Self> {
		StoreBuilder::default().build(initial)
	}

	fn submit(&self, req: Request<K, V>) -> Result<()> {
		self.tx.send(ServerMsg::Request(req)).map_err(|_| StoreError::Shutdown)
	}

	/// Applies `f` to the current value. Read-parallel up to the key's
	/// budget.
	pub async fn get<R, F>(&self, key: K, f: F) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(Option<&V>) -> R + Send + 'static,
	{
		self.get_opts(key, f, CallOpts::default()).await
	}

	pub async fn get_opts<R, F>(&self, key: K, f: F, opts: CallOpts) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(Option<&V>) -> R + Send + 'static,
	{
		let (slot, rx) = ReplySlot::new();
		let on_fail = slot.clone().into_fail_fn();
		self.submit(Request {
			key,
			action: Action::Read(Box::new(move |value: Option<V>| {
				slot.fulfill(Ok(f(value.as_ref())));
			})),
			on_fail: Some(on_fail),
			priority: opts.priority,
			timeout: opts.timeout,
			inserted_at: Instant::now(),
		})?;
		rx.await.map_err(|_| StoreError::Shutdown)?
	}

	/// Like [`Store::get`], but absent keys read as `default`. The default
	/// never becomes stored state.
	pub async fn get_or<R, F>(&self, key: K, default: V, f: F) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(&V) -> R + Send + 'static,
	{
		self.get(key, move |value| match value {
			Some(v) => f(v),
			None => f(&default),
		})
		.await
	}

	/// Clone of the current value.
	pub async fn fetch(&self, key: K) -> Result<Option<V>> {
		self.get(key, |value| value.cloned()).await
	}

	/// Applies `f` with exclusive access to the key's slot; serialized with
	/// every other update on the key. The callback may read, overwrite, or
	/// take the value and replies with its return.
	pub async fn get_and_update<R, F>(&self, key: K, f: F) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(&mut Option<V>) -> R + Send + 'static,
	{
		self.get_and_update_opts(key, f, CallOpts::default()).await
	}

	pub async fn get_and_update_opts<R, F>(&self, key: K, f: F, opts: CallOpts) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(&mut Option<V>) -> R + Send + 'static,
	{
		let (slot, rx) = ReplySlot::new();
		let on_fail = slot.clone().into_fail_fn();
		self.submit(Request {
			key,
			action: Action::Write(Box::new(move |value: &mut Option<V>| {
				let r = f(value);
				slot.fulfill(Ok(r));
			})),
			on_fail: Some(on_fail),
			priority: opts.priority,
			timeout: opts.timeout,
			inserted_at: Instant::now(),
		})?;
		rx.await.map_err(|_| StoreError::Shutdown)?
	}

	/// Serialized update replying `()`.
	pub async fn update<F>(&self, key: K, f: F) -> Result<()>
	where
		F: FnOnce(&mut Option<V>) + Send + 'static,
	{
		self.get_and_update(key, move |slot| f(slot)).await
	}

	/// Fire-and-forget update: no reply, not even errors.
	pub fn cast<F>(&self, key: K, f: F) -> Result<()>
	where
		F: FnOnce(&mut Option<V>) + Send + 'static,
	{
		self.cast_opts(key, f, CallOpts::default())
	}

	pub fn cast_opts<F>(&self, key: K, f: F, opts: CallOpts) -> Result<()>
	where
		F: FnOnce(&mut Option<V>) + Send + 'static,
	{
		self.submit(Request {
			key,
			action: Action::Write(Box::new(move |value: &mut Option<V>| f(value))),
			on_fail: None,
			priority: opts.priority,
			timeout: opts.timeout,
			inserted_at: Instant::now(),
		})
	}

	/// Writes a value.
	pub async fn put(&self, key: K, value: V) -> Result<()> {
		self.update(key, move |slot| {
			*slot = Some(value);
		})
		.await
	}

	/// Removes a value.
	pub async fn delete(&self, key: K) -> Result<()> {
		self.update(key, |slot| {
			*slot = None;
		})
		.await
	}

	/// Removes and returns the current value.
	pub async fn pop(&self, key: K) -> Result<Option<V>> {
		self.get_and_update(key, |slot| slot.take()).await
	}

	/// Advisory per-key budget update: running readers finish; new spawns
	/// respect the new cap immediately.
	pub fn set_max_processes(&self, key: K, cap: usize) -> Result<()> {
		self.tx.send(ServerMsg::MaxProcesses { key, cap }).map_err(|_| StoreError::Shutdown)
	}

	/// Per-key diagnostics, or `None` for keys with no live state.
	pub async fn info(&self, key: K) -> Result<Option<KeyInfo>> {
		let (tx, rx) = oneshot::channel();
		self.tx.send(ServerMsg::Inspect { key, reply: tx }).map_err(|_| StoreError::Shutdown)?;
		rx.await.map_err(|_| StoreError::Shutdown)
	}

	/// Number of keys with live state (cells or workers).
	pub async fn tracked(&self) -> Result<usize> {
		let (tx, rx) = oneshot::channel();
		self.tx.send(ServerMsg::Tracked { reply: tx }).map_err(|_| StoreError::Shutdown)?;
		rx.await.map_err(|_| StoreError::Shutdown)
	}

	/// Runs a multi-key transaction: a consistent snapshot of the get set
	/// feeds `f`, whose [`Publish`] decision is applied atomically per key.
	pub async fn transact<R, F>(&self, multi: Multi<K, V>, f: F) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(Vec<Option<V>>) -> (R, Publish<K, V>) + Send + 'static,
	{
		crate::multi::run(self.tx.clone(), self.cancel.clone(), multi, f).await
	}

	/// Consistent snapshot of the given keys; absent keys are omitted.
	pub async fn take(&self, keys: Vec<K>) -> Result<HashMap<K, V>> {
		let order = keys.clone();
		self.transact(Multi::on(keys).update(Vec::new()), move |values| {
			let map = order
				.into_iter()
				.zip(values)
				.filter_map(|(key, value)| value.map(|v| (key, v)))
				.collect();
			(map, Publish::Keep)
		})
		.await
	}

	/// Stops the store: workers drain their queues and exit; subsequent
	/// calls fail with [`StoreError::Shutdown`]. Idempotent.
	pub async fn stop(&self) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		if self.tx.send(ServerMsg::Stop { reply: tx }).is_err() {
			return Ok(());
		}
		let _ = rx.await;
		Ok(())
	}
}
