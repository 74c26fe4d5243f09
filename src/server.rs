//! Central routing loop.
//!
//! The server owns the key → state map. Keys with no live worker park their
//! state in a [`Cell`]; the first request a cell cannot serve promotes the
//! key to a worker task, which then owns the authoritative state until it
//! negotiates its death back through the server. All map mutation happens on
//! this single task; dispatch never blocks.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cell::{Cell, KeyInfo};
use crate::priority::{Priority, Timeout};
use crate::request::{Action, Info, Request, WorkerMsg};
use crate::task::{self, Defer, TaskKind};
use crate::worker::{self, WorkerSeed};

/// Store-wide defaults applied to fresh cells and workers.
pub(crate) struct Defaults {
	pub name: Arc<str>,
	pub max_processes: usize,
	pub idle_wait: Duration,
}

/// Verdict for a worker's death request. `Continue` returns the state the
/// worker surrendered with its question.
#[derive(Debug)]
pub(crate) enum DieVerdict<V> {
	Die,
	Continue(Option<V>),
}

/// A prepared multi-key transaction, routed (not executed) by the server.
#[derive(Debug)]
pub(crate) struct MultiPlan<K, V> {
	/// Share-and-wait requests for the get-and-update keys.
	pub holds: Vec<Request<K, V>>,
	/// Get-only keys with their collector tags, resolved from workers,
	/// cells, or thin air without creating state.
	pub reads: Vec<(K, usize)>,
	pub collector: mpsc::UnboundedSender<(usize, Option<V>)>,
	pub priority: Priority,
}

/// Messages handled by the server loop.
#[derive(Debug)]
pub(crate) enum ServerMsg<K, V> {
	Request(Request<K, V>),
	Multi(MultiPlan<K, V>),
	/// A cell-spawned read child finished.
	Done { key: K },
	MaxProcesses { key: K, cap: usize },
	DontDie { key: K, pin: bool },
	Inspect {
		key: K,
		reply: oneshot::Sender<Option<KeyInfo>>,
	},
	Tracked { reply: oneshot::Sender<usize> },
	/// Idle-death request: the worker's queues are drained, no read
	/// children are outstanding, and it carries its state out with the
	/// question.
	MayIDie {
		key: K,
		id: u64,
		seen: u64,
		slot: Option<V>,
		max_processes: usize,
		verdict: oneshot::Sender<DieVerdict<V>>,
	},
	/// Crash notice from a worker's drop guard.
	WorkerExited { key: K, id: u64 },
	Stop { reply: oneshot::Sender<()> },
}

struct WorkerHandle<K, V> {
	tx: mpsc::UnboundedSender<WorkerMsg<K, V>>,
	id: u64,
	/// Messages forwarded; compared against the worker's receive count in
	/// the idle-death handshake.
	sent: u64,
}

impl<K, V> WorkerHandle<K, V> {
	/// Counted send. Returns the message when the worker is gone.
	fn forward(&mut self, msg: WorkerMsg<K, V>) -> Result<(), WorkerMsg<K, V>> {
		match self.tx.send(msg) {
			Ok(()) => {
				self.sent = self.sent.wrapping_add(1);
				Ok(())
			}
			Err(err) => Err(err.0),
		}
	}
}

enum Entry<K, V> {
	Cell(Cell<V>),
	Worker(WorkerHandle<K, V>),
}

/// Spawns the server task over pre-validated initial cells, returning its
/// ingress sender.
pub(crate) fn spawn<K, V>(initial: HashMap<K, Cell<V>>, defaults: Defaults, cancel: CancellationToken) -> mpsc::UnboundedSender<ServerMsg<K, V>>
where
	K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
{
	let (tx, rx) = mpsc::unbounded_channel();
	let map = initial.into_iter().map(|(key, cell)| (key, Entry::Cell(cell))).collect();
	let server = Server {
		map,
		defaults,
		rx,
		tx: tx.clone(),
		cancel,
		next_worker_id: 0,
	};
	task::spawn(TaskKind::Server, server.run());
	tx
}

struct Server<K, V> {
	map: HashMap<K, Entry<K, V>>,
	defaults: Defaults,
	rx: mpsc::UnboundedReceiver<ServerMsg<K, V>>,
	tx: mpsc::UnboundedSender<ServerMsg<K, V>>,
	cancel: CancellationToken,
	next_worker_id: u64,
}

impl<K, V> Server<K, V>
where
	K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
{
	async fn run(mut self) {
		tracing::debug!(store = %self.defaults.name, "store.server.start");
		loop {
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => break,
				msg = self.rx.recv() => match msg {
					Some(msg) => {
						if self.handle(msg).is_break() {
							break;
						}
					}
					None => break,
				},
			}
		}
		tracing::debug!(store = %self.defaults.name, "store.server.exit");
	}

	fn handle(&mut self, msg: ServerMsg<K, V>) -> ControlFlow<()> {
		match msg {
			ServerMsg::Request(req) => self.dispatch(req),
			ServerMsg::Multi(plan) => self.route_multi(plan),
			ServerMsg::Done { key } => self.reader_done(&key),
			ServerMsg::MaxProcesses { key, cap } => self.set_max_processes(key, cap),
			ServerMsg::DontDie { key, pin } => {
				if let Some(Entry::Worker(handle)) = self.map.get_mut(&key) {
					let _ = handle.forward(WorkerMsg::Info(Info::DontDie(pin)));
				}
			}
			ServerMsg::Inspect { key, reply } => self.inspect(&key, reply),
			ServerMsg::Tracked { reply } => {
				let _ = reply.send(self.map.len());
			}
			ServerMsg::MayIDie {
				key,
				id,
				seen,
				slot,
				max_processes,
				verdict,
			} => self.answer_death(key, id, seen, slot, max_processes, verdict),
			ServerMsg::WorkerExited { key, id } => {
				if matches!(self.map.get(&key), Some(Entry::Worker(handle)) if handle.id == id) {
					tracing::warn!(store = %self.defaults.name, key = ?key, id, "store.server.worker_crashed");
					self.map.remove(&key);
				}
			}
			ServerMsg::Stop { reply } => {
				// Dropping the handles closes the worker mailboxes; each
				// worker drains its queues and exits.
				self.map.clear();
				self.cancel.cancel();
				let _ = reply.send(());
				tracing::debug!(store = %self.defaults.name, "store.server.stop");
				return ControlFlow::Break(());
			}
		}
		ControlFlow::Continue(())
	}

	/// Single-key dispatch. Loops through crash reclamation and promotion
	/// until the request lands somewhere.
	fn dispatch(&mut self, mut req: Request<K, V>) {
		let budget = match req.timeout.admit(req.inserted_at) {
			Ok(budget) => budget,
			Err(err) => {
				tracing::warn!(store = %self.defaults.name, key = ?req.key, "store.server.expired");
				Request::<K, V>::fail(req.on_fail, err);
				return;
			}
		};

		loop {
			if !self.map.contains_key(&req.key) {
				self.map.insert(req.key.clone(), Entry::Cell(Cell::fresh(self.defaults.max_processes)));
			}

			// Worker route.
			let mut crashed = false;
			if let Some(Entry::Worker(handle)) = self.map.get_mut(&req.key) {
				match handle.forward(WorkerMsg::Request(req)) {
					Ok(()) => return,
					Err(WorkerMsg::Request(returned)) => {
						req = returned;
						crashed = true;
					}
					Err(_) => return,
				}
			}
			if crashed {
				let key = req.key.clone();
				self.reclaim_crashed(&key);
				continue;
			}

			// Cell route: read fast-path under budget (or at `Now`).
			let fast_value = match self.map.get_mut(&req.key) {
				Some(Entry::Cell(cell)) if req.action.is_read() && (req.priority == Priority::Now || cell.processes < cell.max_processes) => {
					cell.processes += 1;
					Some(cell.slot.clone())
				}
				_ => None,
			};
			if let Some(value) = fast_value {
				self.spawn_cell_read(req, value, budget);
				return;
			}

			self.promote(&req.key);
			// Next pass forwards to the fresh worker.
		}
	}

	fn spawn_cell_read(&self, req: Request<K, V>, value: Option<V>, budget: Option<Duration>) {
		let Request { key, action, on_fail, .. } = req;
		let Action::Read(f) = action else {
			unreachable!("cell fast-path admits reads only")
		};
		let done = Defer::new({
			let tx = self.tx.clone();
			let key = key.clone();
			move || {
				let _ = tx.send(ServerMsg::Done { key });
			}
		});
		worker::spawn_read(value, f, on_fail, budget, done);
	}

	/// Replaces a cell with a worker seeded from it. The worker's occupancy
	/// counts the inherited readers plus its own loop slot.
	fn promote(&mut self, key: &K) {
		let Some(Entry::Cell(cell)) = self.map.remove(key) else {
			return;
		};
		let id = self.next_worker_id;
		self.next_worker_id = self.next_worker_id.wrapping_add(1);
		let (tx, rx) = mpsc::unbounded_channel();
		worker::spawn(
			WorkerSeed {
				key: key.clone(),
				id,
				slot: cell.slot,
				processes: cell.processes + 1,
				max_processes: cell.max_processes,
				idle_wait: self.defaults.idle_wait,
				store: Arc::clone(&self.defaults.name),
			},
			rx,
			self.tx.clone(),
		);
		self.map.insert(key.clone(), Entry::Worker(WorkerHandle { tx, id, sent: 0 }));
		tracing::debug!(store = %self.defaults.name, key = ?key, id, "store.server.promote");
	}

	fn ensure_worker(&mut self, key: &K) {
		match self.map.get(key) {
			Some(Entry::Worker(_)) => {}
			Some(Entry::Cell(_)) => self.promote(key),
			None => {
				self.map.insert(key.clone(), Entry::Cell(Cell::fresh(self.defaults.max_processes)));
				self.promote(key);
			}
		}
	}

	fn reclaim_crashed(&mut self, key: &K) {
		tracing::warn!(store = %self.defaults.name, key = ?key, "store.server.reclaim");
		self.map.remove(key);
	}

	fn reader_done(&mut self, key: &K) {
		let default_max = self.defaults.max_processes;
		let reclaim = match self.map.get_mut(key) {
			Some(Entry::Cell(cell)) => {
				cell.processes = cell.processes.saturating_sub(1);
				cell.reclaimable(default_max)
			}
			Some(Entry::Worker(handle)) => {
				// The worker inherited this reader's slot at promotion.
				let _ = handle.forward(WorkerMsg::Info(Info::Done));
				false
			}
			None => false,
		};
		if reclaim {
			tracing::trace!(store = %self.defaults.name, key = ?key, "store.server.gc");
			self.map.remove(key);
		}
	}

	fn set_max_processes(&mut self, key: K, cap: usize) {
		let default_max = self.defaults.max_processes;
		let mut insert_missing = false;
		let reclaim = match self.map.get_mut(&key) {
			Some(Entry::Worker(handle)) => {
				let _ = handle.forward(WorkerMsg::Info(Info::MaxProcesses(cap)));
				false
			}
			Some(Entry::Cell(cell)) => {
				cell.max_processes = cap;
				cell.reclaimable(default_max)
			}
			None => {
				// A non-default budget is per-key state worth keeping.
				insert_missing = cap != default_max;
				false
			}
		};
		if reclaim {
			self.map.remove(&key);
		} else if insert_missing {
			self.map.insert(key, Entry::Cell(Cell::fresh(cap)));
		}
	}

	fn inspect(&mut self, key: &K, reply: oneshot::Sender<Option<KeyInfo>>) {
		match self.map.get_mut(key) {
			Some(Entry::Cell(cell)) => {
				let _ = reply.send(Some(KeyInfo {
					worker: false,
					processes: cell.processes,
					max_processes: cell.max_processes,
				}));
			}
			Some(Entry::Worker(handle)) => {
				if let Err(WorkerMsg::Info(Info::Inspect(reply))) = handle.forward(WorkerMsg::Info(Info::Inspect(reply))) {
					let _ = reply.send(None);
				}
			}
			None => {
				let _ = reply.send(None);
			}
		}
	}

	/// Phase 1 of a transaction: hold the get-and-update keys, resolve the
	/// get-only keys. Routing only; the coordinator task does the rest.
	fn route_multi(&mut self, plan: MultiPlan<K, V>) {
		let MultiPlan {
			holds,
			reads,
			collector,
			priority,
		} = plan;
		for req in holds {
			self.ensure_worker(&req.key);
			if let Some(Entry::Worker(handle)) = self.map.get_mut(&req.key) {
				let _ = handle.forward(WorkerMsg::Info(Info::DontDie(true)));
			}
			self.dispatch(req);
		}
		for (key, tag) in reads {
			let mut crashed = false;
			let direct = match self.map.get_mut(&key) {
				Some(Entry::Worker(handle)) => {
					let req = Request {
						key: key.clone(),
						action: Action::Share {
							tag,
							to: collector.clone(),
						},
						on_fail: None,
						priority,
						timeout: Timeout::Infinite,
						inserted_at: Instant::now(),
					};
					match handle.forward(WorkerMsg::Request(req)) {
						Ok(()) => None,
						Err(_) => {
							// Crashed worker: its state is gone.
							crashed = true;
							Some(None)
						}
					}
				}
				Some(Entry::Cell(cell)) => Some(cell.slot.clone()),
				// A pure read never creates state for a missing key.
				None => Some(None),
			};
			if crashed {
				self.reclaim_crashed(&key);
			}
			if let Some(value) = direct {
				let _ = collector.send((tag, value));
			}
		}
	}

	fn answer_death(&mut self, key: K, id: u64, seen: u64, slot: Option<V>, max_processes: usize, verdict: oneshot::Sender<DieVerdict<V>>) {
		let current = matches!(self.map.get(&key), Some(Entry::Worker(handle)) if handle.id == id);
		if !current {
			// Superseded generation; nothing to commit.
			let _ = verdict.send(DieVerdict::Die);
			return;
		}
		let Some(Entry::Worker(handle)) = self.map.get(&key) else {
			unreachable!("checked above")
		};
		if handle.sent != seen {
			// Messages are still in flight toward the worker.
			let _ = verdict.send(DieVerdict::Continue(slot));
			return;
		}
		// Commit the surrendered state before the verdict, so any later
		// request for this key dispatches against it. A worker only asks
		// to die with no read children left, so the cell restarts at zero
		// occupancy.
		self.map.remove(&key);
		let cell = Cell {
			slot,
			processes: 0,
			max_processes,
		};
		if !cell.reclaimable(self.defaults.max_processes) {
			self.map.insert(key.clone(), Entry::Cell(cell));
		}
		let _ = verdict.send(DieVerdict::Die);
		tracing::debug!(store = %self.defaults.name, key = ?key, id, "store.server.retire");
	}
}
