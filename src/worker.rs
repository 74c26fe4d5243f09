//! Per-key executor.
//!
//! A worker owns its key's authoritative state while alive. It drains its
//! mailbox into one FIFO deque per priority band, executes update-class
//! requests inline (serialization), fans reads out to child tasks under the
//! key's parallelism budget, and when idle negotiates its own death with the
//! server, surrendering the state it carried.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::StoreError;
use crate::multi::KeyStep;
use crate::priority::Priority;
use crate::request::{Action, FailFn, Info, ReadFn, Request, WorkerMsg, WriteFn};
use crate::server::{DieVerdict, ServerMsg};
use crate::task::{self, Defer, TaskKind, panic_message};

/// State a worker is born with: the cell contents at promotion time.
pub(crate) struct WorkerSeed<K, V> {
	pub key: K,
	pub id: u64,
	pub slot: Option<V>,
	/// Occupancy including the worker's own loop slot (cell readers + 1).
	pub processes: usize,
	pub max_processes: usize,
	pub idle_wait: Duration,
	pub store: Arc<str>,
}

/// Spawns the worker task for one key, armed with a crash notice.
pub(crate) fn spawn<K, V>(seed: WorkerSeed<K, V>, rx: mpsc::UnboundedReceiver<WorkerMsg<K, V>>, server: mpsc::UnboundedSender<ServerMsg<K, V>>)
where
	K: Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
{
	let guard = Defer::new({
		let server = server.clone();
		let key = seed.key.clone();
		let id = seed.id;
		move || {
			let _ = server.send(ServerMsg::WorkerExited { key, id });
		}
	});
	let (done_tx, done_rx) = mpsc::unbounded_channel();
	let worker = Worker {
		key: seed.key,
		id: seed.id,
		slot: seed.slot,
		processes: seed.processes,
		max_processes: seed.max_processes,
		idle_wait: seed.idle_wait,
		dont_die: false,
		seen: 0,
		urgent: VecDeque::new(),
		high: VecDeque::new(),
		normal: VecDeque::new(),
		rx,
		done_tx,
		done_rx,
		server,
		store: seed.store,
	};
	task::spawn(TaskKind::Worker, worker.run(guard));
}

enum Received<K, V> {
	Routed(WorkerMsg<K, V>),
	ReaderDone,
	Closed,
}

enum DeathFlow {
	Exit,
	Resume,
}

struct Worker<K, V> {
	key: K,
	id: u64,
	slot: Option<V>,
	/// Occupancy including this loop's own slot.
	processes: usize,
	max_processes: usize,
	idle_wait: Duration,
	dont_die: bool,
	/// Messages received from the server; compared against the server's
	/// send count in the idle-death handshake.
	seen: u64,
	urgent: VecDeque<Request<K, V>>,
	high: VecDeque<Request<K, V>>,
	normal: VecDeque<Request<K, V>>,
	rx: mpsc::UnboundedReceiver<WorkerMsg<K, V>>,
	/// Read children report completion here, not through the server-routed
	/// mailbox, so `seen` stays comparable to the server's `sent`.
	done_tx: mpsc::UnboundedSender<()>,
	done_rx: mpsc::UnboundedReceiver<()>,
	server: mpsc::UnboundedSender<ServerMsg<K, V>>,
	store: Arc<str>,
}

impl<K, V> Worker<K, V>
where
	K: Clone + fmt::Debug + Send + 'static,
	V: Clone + Send + 'static,
{
	async fn run(mut self, mut guard: Defer) {
		tracing::debug!(store = %self.store, key = ?self.key, id = self.id, "store.worker.spawn");
		loop {
			while self.done_rx.try_recv().is_ok() {
				self.processes = self.processes.saturating_sub(1);
			}

			let mut closed = false;
			loop {
				match self.rx.try_recv() {
					Ok(msg) => {
						self.seen = self.seen.wrapping_add(1);
						self.place(msg).await;
					}
					Err(TryRecvError::Empty) => break,
					Err(TryRecvError::Disconnected) => {
						closed = true;
						break;
					}
				}
			}
			if closed {
				self.run_down().await;
				guard.disarm();
				return;
			}

			if let Some(req) = self.select() {
				self.execute(req).await;
				continue;
			}

			match tokio::time::timeout(self.idle_wait, self.recv_any()).await {
				Ok(Received::Routed(msg)) => {
					self.seen = self.seen.wrapping_add(1);
					self.place(msg).await;
				}
				Ok(Received::ReaderDone) => {
					self.processes = self.processes.saturating_sub(1);
				}
				Ok(Received::Closed) => {
					self.run_down().await;
					guard.disarm();
					return;
				}
				Err(_) => {
					// Never ask to die while read children are still
					// running: the cell a death commits restarts at zero
					// occupancy, so outstanding readers must finish (and
					// report) first.
					if self.dont_die || self.processes > 1 {
						continue;
					}
					match self.negotiate_death().await {
						DeathFlow::Exit => {
							tracing::debug!(store = %self.store, key = ?self.key, id = self.id, reason = "idle", "store.worker.exit");
							guard.disarm();
							return;
						}
						DeathFlow::Resume => self.raise_idle_wait(),
					}
				}
			}
		}
	}

	async fn recv_any(&mut self) -> Received<K, V> {
		tokio::select! {
			biased;
			done = self.done_rx.recv() => match done {
				Some(()) => Received::ReaderDone,
				// We hold a sender, so the channel cannot close.
				None => Received::ReaderDone,
			},
			msg = self.rx.recv() => match msg {
				Some(msg) => Received::Routed(msg),
				None => Received::Closed,
			},
		}
	}

	/// Queue placement: FIFO within each band. `Now` requests skip the
	/// queues and execute against the currently visible state; control
	/// messages apply immediately.
	async fn place(&mut self, msg: WorkerMsg<K, V>) {
		match msg {
			WorkerMsg::Info(info) => self.apply_info(info),
			WorkerMsg::Request(req) => match req.priority {
				Priority::Now => self.execute(req).await,
				Priority::Urgent => self.urgent.push_back(req),
				Priority::High => self.high.push_back(req),
				Priority::Normal => self.normal.push_back(req),
			},
		}
	}

	fn apply_info(&mut self, info: Info) {
		match info {
			Info::Done => self.processes = self.processes.saturating_sub(1),
			Info::DontDie(pin) => self.dont_die = pin,
			Info::MaxProcesses(cap) => self.max_processes = cap,
			Info::Inspect(reply) => {
				let _ = reply.send(Some(crate::cell::KeyInfo {
					worker: true,
					processes: self.processes.saturating_sub(1),
					max_processes: self.max_processes,
				}));
			}
		}
	}

	fn select(&mut self) -> Option<Request<K, V>> {
		self.urgent
			.pop_front()
			.or_else(|| self.high.pop_front())
			.or_else(|| self.normal.pop_front())
	}

	async fn execute(&mut self, req: Request<K, V>) {
		let Request {
			action,
			on_fail,
			priority,
			timeout,
			inserted_at,
			..
		} = req;
		let budget = match timeout.admit(inserted_at) {
			Ok(budget) => budget,
			Err(err) => {
				tracing::warn!(store = %self.store, key = ?self.key, "store.worker.expired");
				Request::<K, V>::fail(on_fail, err);
				return;
			}
		};
		match action {
			Action::Read(f) => self.execute_read(f, on_fail, budget, priority).await,
			Action::Write(f) => self.execute_write(f, on_fail, budget).await,
			Action::Share { tag, to } => {
				let _ = to.send((tag, self.slot.clone()));
			}
			Action::ShareAndWait { tag, to, commit } => {
				let _ = to.send((tag, self.slot.clone()));
				match commit.await {
					Ok(step) => self.apply_step(step),
					// Coordinator gone: unblock with no state change.
					Err(_) => tracing::debug!(store = %self.store, key = ?self.key, "store.worker.commit_lost"),
				}
			}
		}
	}

	async fn execute_read(&mut self, f: ReadFn<V>, on_fail: Option<FailFn>, budget: Option<Duration>, priority: Priority) {
		if priority == Priority::Now || self.processes < self.max_processes {
			self.processes += 1;
			let done_tx = self.done_tx.clone();
			let done = Defer::new(move || {
				let _ = done_tx.send(());
			});
			spawn_read(self.slot.clone(), f, on_fail, budget, done);
		} else {
			// Budget exhausted: the loop's own slot serves the read.
			run_read(self.slot.clone(), f, on_fail, budget).await;
		}
	}

	async fn execute_write(&mut self, f: WriteFn<V>, on_fail: Option<FailFn>, budget: Option<Duration>) {
		match budget {
			None => {
				if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&mut self.slot))) {
					let panic = panic_message(payload.as_ref());
					tracing::warn!(store = %self.store, key = ?self.key, %panic, "store.worker.callback_panic");
					Request::<K, V>::fail(on_fail, StoreError::CallbackPanicked(panic));
				}
			}
			Some(limit) => {
				// Run on a scratch clone; commit only on in-budget
				// completion so an overrun keeps the pre-call value.
				let mut scratch = self.slot.clone();
				let mut handle = task::spawn(TaskKind::Callback, async move {
					f(&mut scratch);
					scratch
				});
				match tokio::time::timeout(limit, &mut handle).await {
					Ok(Ok(scratch)) => self.slot = scratch,
					Ok(Err(join)) if join.is_panic() => {
						let panic = panic_message(join.into_panic().as_ref());
						tracing::warn!(store = %self.store, key = ?self.key, %panic, "store.worker.callback_panic");
						Request::<K, V>::fail(on_fail, StoreError::CallbackPanicked(panic));
					}
					Ok(Err(_)) => {}
					Err(_) => {
						handle.abort();
						tracing::warn!(store = %self.store, key = ?self.key, limit_ms = limit.as_millis() as u64, "store.worker.too_long");
						Request::<K, V>::fail(on_fail, StoreError::TooLong);
					}
				}
			}
		}
	}

	fn apply_step(&mut self, step: KeyStep<V>) {
		match step {
			KeyStep::Keep => {}
			KeyStep::Put(v) => self.slot = Some(v),
			KeyStep::Drop => self.slot = None,
		}
	}

	/// Mailbox closed: the store is stopping. Finish what was queued, then
	/// exit without a handshake.
	async fn run_down(&mut self) {
		while let Some(req) = self.select() {
			self.execute(req).await;
		}
		tracing::debug!(store = %self.store, key = ?self.key, id = self.id, reason = "closed", "store.worker.exit");
	}

	/// The `Idle -> AwaitDie -> {Idle | Dead}` protocol. Only entered with
	/// drained queues and no read children outstanding; the slot travels
	/// with the question and comes back with a `Continue` verdict.
	async fn negotiate_death(&mut self) -> DeathFlow {
		let (verdict_tx, verdict_rx) = tokio::sync::oneshot::channel();
		let msg = ServerMsg::MayIDie {
			key: self.key.clone(),
			id: self.id,
			seen: self.seen,
			slot: self.slot.take(),
			max_processes: self.max_processes,
			verdict: verdict_tx,
		};
		if self.server.send(msg).is_err() {
			// Server gone; nothing left to surrender the state to.
			return DeathFlow::Exit;
		}
		match verdict_rx.await {
			Ok(DieVerdict::Continue(slot)) => {
				self.slot = slot;
				DeathFlow::Resume
			}
			Ok(DieVerdict::Die) | Err(_) => DeathFlow::Exit,
		}
	}

	fn raise_idle_wait(&mut self) {
		let jitter = rand::rng().random_range(1..=25u64);
		self.idle_wait += Duration::from_millis(jitter);
	}
}

/// Runs a read callback against a snapshot, supervising the break budget.
pub(crate) async fn run_read<V>(value: Option<V>, f: ReadFn<V>, on_fail: Option<FailFn>, budget: Option<Duration>)
where
	V: Send + 'static,
{
	match budget {
		None => {
			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(value))) {
				let panic = panic_message(payload.as_ref());
				tracing::warn!(%panic, "store.read.callback_panic");
				if let Some(fail) = on_fail {
					fail(StoreError::CallbackPanicked(panic));
				}
			}
		}
		Some(limit) => {
			let mut handle = task::spawn(TaskKind::Callback, async move { f(value) });
			match tokio::time::timeout(limit, &mut handle).await {
				Ok(Ok(())) => {}
				Ok(Err(join)) if join.is_panic() => {
					let panic = panic_message(join.into_panic().as_ref());
					tracing::warn!(%panic, "store.read.callback_panic");
					if let Some(fail) = on_fail {
						fail(StoreError::CallbackPanicked(panic));
					}
				}
				Ok(Err(_)) => {}
				Err(_) => {
					handle.abort();
					tracing::warn!(limit_ms = limit.as_millis() as u64, "store.read.too_long");
					if let Some(fail) = on_fail {
						fail(StoreError::TooLong);
					}
				}
			}
		}
	}
}

/// Spawns a read child holding a completion guard; the guard fires on every
/// exit path so the budget slot is always returned.
pub(crate) fn spawn_read<V>(value: Option<V>, f: ReadFn<V>, on_fail: Option<FailFn>, budget: Option<Duration>, done: Defer)
where
	V: Send + 'static,
{
	task::spawn(TaskKind::Reader, async move {
		let _done = done;
		run_read(value, f, on_fail, budget).await;
	});
}
