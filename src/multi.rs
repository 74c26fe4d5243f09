//! Multi-key transactions.
//!
//! A transaction partitions its key set into get-only, get-and-update, and
//! update-only keys, collects a consistent snapshot (get-and-update keys
//! stay held by their workers mid-request), runs the callback on it, then
//! publishes one action per update key: a commit down each held key's slot,
//! and a `High`-priority internal update through the server for the rest.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::priority::{Priority, Timeout};
use crate::request::{Action, Request};
use crate::server::{MultiPlan, ServerMsg};
use crate::store::CallOpts;
use crate::task::{self, TaskKind, panic_message};

/// Per-key publish action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStep<V> {
	/// Leave the value as it is.
	Keep,
	/// Write a new value.
	Put(V),
	/// Remove the value.
	Drop,
}

/// What a transaction callback decides for its update set.
#[derive(Debug)]
pub enum Publish<K, V> {
	/// Leave every update key unchanged.
	Keep,
	/// Remove every update key.
	Drop,
	/// One value per update key, in update-set order. Length must match.
	Set(Vec<V>),
	/// One action per update key, in update-set order. Length must match.
	Each(Vec<KeyStep<V>>),
	/// Values by key; update keys missing from the map are removed.
	Map(HashMap<K, V>),
}

/// A transaction description: the key set, its get/update subsets, the
/// placeholder for absent keys, and call options.
#[derive(Debug)]
pub struct Multi<K, V> {
	keys: Vec<K>,
	get: Option<Vec<K>>,
	upd: Option<Vec<K>>,
	initial: Option<V>,
	opts: CallOpts,
}

impl<K, V> Multi<K, V> {
	/// A transaction over `keys`, reading and updating all of them.
	pub fn on(keys: Vec<K>) -> Self {
		Self {
			keys,
			get: None,
			upd: None,
			initial: None,
			opts: CallOpts::default(),
		}
	}

	/// Restricts the keys whose values feed the callback. Keys outside the
	/// transaction's key set are ignored.
	pub fn get(mut self, keys: Vec<K>) -> Self {
		self.get = Some(keys);
		self
	}

	/// Restricts the keys the callback may update. Keys outside the
	/// transaction's key set are ignored.
	pub fn update(mut self, keys: Vec<K>) -> Self {
		self.upd = Some(keys);
		self
	}

	/// Placeholder handed to the callback for absent keys.
	pub fn initial(mut self, value: V) -> Self {
		self.initial = Some(value);
		self
	}

	/// Priority and timeout for the transaction.
	pub fn opts(mut self, opts: CallOpts) -> Self {
		self.opts = opts;
		self
	}
}

/// An update key's publish route.
#[derive(Debug)]
enum UpdTarget<K, V> {
	/// Key held by its worker; publish travels down the commit slot.
	Hold { key: K, commit: oneshot::Sender<KeyStep<V>> },
	/// Key not read by the callback; publish is an internal server request.
	Route { key: K },
}

impl<K, V> UpdTarget<K, V> {
	fn key(&self) -> &K {
		match self {
			Self::Hold { key, .. } | Self::Route { key } => key,
		}
	}
}

#[derive(Debug)]
struct Prepared<K, V> {
	plan: MultiPlan<K, V>,
	collector_rx: mpsc::UnboundedReceiver<(usize, Option<V>)>,
	/// Number of get-set keys expected to report.
	expected: usize,
	upd: Vec<UpdTarget<K, V>>,
	initial: Option<V>,
	budget: Option<Duration>,
}

/// Partitions the key set and builds the share / share-and-wait requests.
fn prepare<K, V>(multi: Multi<K, V>) -> Result<Prepared<K, V>>
where
	K: Eq + Hash + Clone + fmt::Debug,
{
	let Multi {
		keys,
		get,
		upd,
		initial,
		opts,
	} = multi;

	let mut members = HashSet::with_capacity(keys.len());
	for key in &keys {
		if !members.insert(key.clone()) {
			return Err(StoreError::DuplicateKeys(format!("{key:?}")));
		}
	}

	let get_sel: Option<HashSet<K>> = get.map(|sel| sel.into_iter().collect());
	let upd_sel: Option<HashSet<K>> = upd.map(|sel| sel.into_iter().collect());

	let (collector, collector_rx) = mpsc::unbounded_channel();
	let now = Instant::now();
	let mut holds = Vec::new();
	let mut reads = Vec::new();
	let mut upd_targets = Vec::new();
	let mut tag = 0usize;

	for key in keys {
		let in_get = get_sel.as_ref().is_none_or(|sel| sel.contains(&key));
		let in_upd = upd_sel.as_ref().is_none_or(|sel| sel.contains(&key));
		match (in_get, in_upd) {
			(true, true) => {
				let (commit_tx, commit_rx) = oneshot::channel();
				holds.push(Request {
					key: key.clone(),
					action: Action::ShareAndWait {
						tag,
						to: collector.clone(),
						commit: commit_rx,
					},
					on_fail: None,
					priority: opts.priority,
					timeout: Timeout::Infinite,
					inserted_at: now,
				});
				upd_targets.push(UpdTarget::Hold { key, commit: commit_tx });
				tag += 1;
			}
			(true, false) => {
				reads.push((key, tag));
				tag += 1;
			}
			(false, true) => upd_targets.push(UpdTarget::Route { key }),
			(false, false) => {}
		}
	}

	Ok(Prepared {
		plan: MultiPlan {
			holds,
			reads,
			collector,
			priority: opts.priority,
		},
		collector_rx,
		expected: tag,
		upd: upd_targets,
		initial,
		budget: opts.timeout.collect_budget(),
	})
}

/// Runs a transaction end to end: routes the plan through the server,
/// coordinates collect/callback/publish in a detached task, and returns
/// the callback's reply.
pub(crate) async fn run<K, V, R, F>(server: mpsc::UnboundedSender<ServerMsg<K, V>>, cancel: CancellationToken, multi: Multi<K, V>, callback: F) -> Result<R>
where
	K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
	R: Send + 'static,
	F: FnOnce(Vec<Option<V>>) -> (R, Publish<K, V>) + Send + 'static,
{
	let prepared = prepare(multi)?;
	let (reply_tx, reply_rx) = oneshot::channel();
	server.send(ServerMsg::Multi(prepared.plan)).map_err(|_| StoreError::Shutdown)?;
	task::spawn(
		TaskKind::Coordinator,
		coordinate(
			prepared.collector_rx,
			prepared.expected,
			prepared.budget,
			prepared.upd,
			prepared.initial,
			callback,
			reply_tx,
			server,
			cancel,
		),
	);
	reply_rx.await.map_err(|_| StoreError::Shutdown)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collect {
	Complete,
	Lost,
	TimedOut,
	Cancelled,
}

async fn fill<V>(collector: &mut mpsc::UnboundedReceiver<(usize, Option<V>)>, known: &mut [Option<V>], got: &mut [bool], remaining: &mut usize) -> bool {
	while *remaining > 0 {
		match collector.recv().await {
			Some((tag, value)) => {
				if tag < known.len() && !got[tag] {
					got[tag] = true;
					known[tag] = value;
					*remaining -= 1;
				}
			}
			None => break,
		}
	}
	*remaining == 0
}

async fn sleep_budget(budget: Option<Duration>) {
	match budget {
		Some(d) => tokio::time::sleep(d).await,
		None => std::future::pending().await,
	}
}

/// Unblocks every held worker with no state change.
fn abort_holds<K, V>(upd: Vec<UpdTarget<K, V>>, server: &mpsc::UnboundedSender<ServerMsg<K, V>>) {
	for target in upd {
		if let UpdTarget::Hold { key, commit } = target {
			let _ = commit.send(KeyStep::Keep);
			let _ = server.send(ServerMsg::DontDie { key, pin: false });
		}
	}
}

fn resolve_steps<K, V>(publish: Publish<K, V>, upd: &[UpdTarget<K, V>]) -> Result<Vec<KeyStep<V>>>
where
	K: Eq + Hash,
{
	let expected = upd.len();
	match publish {
		Publish::Keep => Ok((0..expected).map(|_| KeyStep::Keep).collect()),
		Publish::Drop => Ok((0..expected).map(|_| KeyStep::Drop).collect()),
		Publish::Set(values) => {
			if values.len() != expected {
				return Err(StoreError::BadPublish {
					expected,
					got: values.len(),
				});
			}
			Ok(values.into_iter().map(KeyStep::Put).collect())
		}
		Publish::Each(steps) => {
			if steps.len() != expected {
				return Err(StoreError::BadPublish { expected, got: steps.len() });
			}
			Ok(steps)
		}
		Publish::Map(mut map) => Ok(upd
			.iter()
			.map(|target| match map.remove(target.key()) {
				Some(value) => KeyStep::Put(value),
				None => KeyStep::Drop,
			})
			.collect()),
	}
}

#[allow(clippy::too_many_arguments)]
async fn coordinate<K, V, R, F>(
	mut collector: mpsc::UnboundedReceiver<(usize, Option<V>)>,
	expected: usize,
	budget: Option<Duration>,
	upd: Vec<UpdTarget<K, V>>,
	initial: Option<V>,
	callback: F,
	reply: oneshot::Sender<Result<R>>,
	server: mpsc::UnboundedSender<ServerMsg<K, V>>,
	cancel: CancellationToken,
) where
	K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
	R: Send + 'static,
	F: FnOnce(Vec<Option<V>>) -> (R, Publish<K, V>) + Send + 'static,
{
	// Collect.
	let mut known: Vec<Option<V>> = Vec::new();
	known.resize_with(expected, || None);
	let mut got = vec![false; expected];
	let mut remaining = expected;
	let outcome = tokio::select! {
		biased;
		_ = cancel.cancelled() => Collect::Cancelled,
		complete = fill(&mut collector, &mut known, &mut got, &mut remaining) => {
			if complete { Collect::Complete } else { Collect::Lost }
		}
		_ = sleep_budget(budget) => Collect::TimedOut,
	};
	if outcome != Collect::Complete {
		tracing::warn!(?outcome, expected, missing = remaining, "store.multi.collect_failed");
		abort_holds(upd, &server);
		let err = match outcome {
			Collect::Cancelled => StoreError::Shutdown,
			_ => StoreError::WorkerCrashed,
		};
		let _ = reply.send(Err(err));
		return;
	}

	// Callback, with holes filled by the transaction's initial.
	let args: Vec<Option<V>> = known.into_iter().map(|v| v.or_else(|| initial.clone())).collect();
	let (ret, publish) = match catch_unwind(AssertUnwindSafe(move || callback(args))) {
		Ok(pair) => pair,
		Err(payload) => {
			let panic = panic_message(payload.as_ref());
			tracing::warn!(%panic, "store.multi.callback_panic");
			abort_holds(upd, &server);
			let _ = reply.send(Err(StoreError::CallbackPanicked(panic)));
			return;
		}
	};

	// Publish.
	let steps = match resolve_steps(publish, &upd) {
		Ok(steps) => steps,
		Err(err) => {
			tracing::warn!(error = %err, "store.multi.bad_publish");
			abort_holds(upd, &server);
			let _ = reply.send(Err(err));
			return;
		}
	};
	for (target, step) in upd.into_iter().zip(steps) {
		match target {
			UpdTarget::Hold { key, commit } => {
				let _ = commit.send(step);
				let _ = server.send(ServerMsg::DontDie { key, pin: false });
			}
			UpdTarget::Route { key } => {
				let action = match step {
					// Nothing to change; skip the round-trip.
					KeyStep::Keep => continue,
					KeyStep::Put(value) => Action::Write(Box::new(move |slot: &mut Option<V>| {
						*slot = Some(value);
					})),
					KeyStep::Drop => Action::Write(Box::new(|slot: &mut Option<V>| {
						*slot = None;
					})),
				};
				let _ = server.send(ServerMsg::Request(Request {
					key,
					action,
					on_fail: None,
					priority: Priority::High,
					timeout: Timeout::Infinite,
					inserted_at: Instant::now(),
				}));
			}
		}
	}
	let _ = reply.send(Ok(ret));
}
