//! Invariant checks: per-key linearizability, read budgets, idle-death
//! safety, transaction edge cases, and a randomized model comparison.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cellmap::{CallOpts, KeyStep, Multi, Publish, Store, StoreError, Timeout};
use futures::future::join_all;

fn init_tracing() {
	let _ = tracing_subscriber::fmt::try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn updates_are_linearizable_per_key() {
	init_tracing();
	let store = Store::new([("log", Vec::<u32>::new())]).unwrap();

	let writers: Vec<_> = (0..4u32)
		.map(|writer| {
			let store = store.clone();
			tokio::spawn(async move {
				for seq in 0..50u32 {
					let id = writer * 1000 + seq;
					store
						.get_and_update("log", move |slot| {
							slot.get_or_insert_with(Vec::new).push(id);
						})
						.await
						.unwrap();
				}
			})
		})
		.collect();
	for writer in join_all(writers).await {
		writer.unwrap();
	}

	// Every callback ran exactly once against the latest value: no lost or
	// duplicated appends.
	let log = store.fetch("log").await.unwrap().unwrap();
	assert_eq!(log.len(), 200);
	let mut sorted = log;
	sorted.sort_unstable();
	sorted.dedup();
	assert_eq!(sorted.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_reads_respect_the_budget() {
	init_tracing();
	let store = Store::builder().max_processes(3).build([("k", 0u32)]).unwrap();
	// Force a worker so the budget covers both spawned and inline reads.
	store.put("k", 1).await.unwrap();

	let current = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));
	let reads: Vec<_> = (0..12)
		.map(|_| {
			let store = store.clone();
			let current = Arc::clone(&current);
			let peak = Arc::clone(&peak);
			tokio::spawn(async move {
				store
					.get("k", move |_value| {
						let running = current.fetch_add(1, Ordering::SeqCst) + 1;
						peak.fetch_max(running, Ordering::SeqCst);
						std::thread::sleep(Duration::from_millis(30));
						current.fetch_sub(1, Ordering::SeqCst);
					})
					.await
					.unwrap();
			})
		})
		.collect();
	for read in join_all(reads).await {
		read.unwrap();
	}

	let peak = peak.load(Ordering::SeqCst);
	assert!(peak <= 3, "read concurrency {peak} exceeded the budget");
	assert!(peak >= 2, "reads never ran in parallel");
}

#[tokio::test]
async fn idle_death_commits_state_before_the_next_request() {
	init_tracing();
	let store = Store::builder().idle_wait(Duration::from_millis(25)).build::<&str, u32>([]).unwrap();

	for i in 0..8 {
		store.put("k", i).await.unwrap();
		// Let the worker die of idleness between operations.
		tokio::time::sleep(Duration::from_millis(70)).await;
		assert_eq!(store.fetch("k").await.unwrap(), Some(i));
	}
}

#[tokio::test]
async fn keep_never_mutates_and_pop_is_idempotent() {
	init_tracing();
	let store = Store::new([("a", 3u32)]).unwrap();

	store.update("a", |_slot| {}).await.unwrap();
	assert_eq!(store.fetch("a").await.unwrap(), Some(3));

	assert_eq!(store.pop("a").await.unwrap(), Some(3));
	store.update("a", |_slot| {}).await.unwrap();
	assert_eq!(store.fetch("a").await.unwrap(), None);
	assert_eq!(store.pop("a").await.unwrap(), None);
}

#[tokio::test]
async fn take_returns_existing_keys_only() {
	init_tracing();
	let store = Store::new([("a", 1u32), ("c", 3)]).unwrap();

	let snapshot = store.take(vec!["a", "b", "c"]).await.unwrap();
	let expected: HashMap<&str, u32> = [("a", 1), ("c", 3)].into_iter().collect();
	assert_eq!(snapshot, expected);
}

#[tokio::test]
async fn update_only_keys_are_published_through_the_server() {
	init_tracing();
	let store = Store::new([("a", 1u32)]).unwrap();

	let read_a = store
		.transact(Multi::on(vec!["a", "b"]).get(vec!["a"]), |values| {
			assert_eq!(values.len(), 1);
			(values[0], Publish::Set(vec![10, 20]))
		})
		.await
		.unwrap();

	assert_eq!(read_a, Some(1));
	assert_eq!(store.fetch("a").await.unwrap(), Some(10));
	assert_eq!(store.fetch("b").await.unwrap(), Some(20));
}

#[tokio::test]
async fn initial_fills_holes_without_storing_anything() {
	init_tracing();
	let store = Store::<&str, u32>::new([]).unwrap();

	let values = store
		.transact(Multi::on(vec!["x", "y"]).initial(7).update(Vec::new()), |values| (values, Publish::Keep))
		.await
		.unwrap();

	assert_eq!(values, vec![Some(7), Some(7)]);
	assert_eq!(store.fetch("x").await.unwrap(), None);
	assert_eq!(store.fetch("y").await.unwrap(), None);
}

#[tokio::test]
async fn bad_publish_releases_held_keys_unchanged() {
	init_tracing();
	let store = Store::new([("a", 1u32), ("b", 2)]).unwrap();

	let err = store
		.transact(Multi::on(vec!["a", "b"]), |_values| ((), Publish::Set(vec![9u32])))
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::BadPublish { expected: 2, got: 1 }));

	assert_eq!(store.fetch("a").await.unwrap(), Some(1));
	assert_eq!(store.fetch("b").await.unwrap(), Some(2));
}

#[tokio::test]
async fn transaction_panic_unblocks_and_store_survives() {
	init_tracing();
	let store = Store::new([("a", 1u32)]).unwrap();

	let err = store
		.transact(Multi::on(vec!["a"]), |_values| -> ((), Publish<&str, u32>) { panic!("tx bug") })
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::CallbackPanicked(msg) if msg.contains("tx bug")));

	store.put("a", 5).await.unwrap();
	assert_eq!(store.fetch("a").await.unwrap(), Some(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transaction_collect_timeout_releases_the_hold() {
	init_tracing();
	let store = Store::new([("a", 1u32)]).unwrap();

	// Wedge the key so the transaction's hold cannot execute in time.
	store
		.cast("a", |_slot| {
			std::thread::sleep(Duration::from_millis(300));
		})
		.unwrap();
	tokio::time::sleep(Duration::from_millis(10)).await;

	let err = store
		.transact(
			Multi::on(vec!["a"]).opts(CallOpts::default().timeout(Timeout::Hard(Duration::from_millis(50)))),
			|values| (values, Publish::Drop),
		)
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::WorkerCrashed));

	// The late hold is released with no state change; the failed
	// transaction's `Drop` never publishes.
	tokio::time::sleep(Duration::from_millis(350)).await;
	assert_eq!(store.fetch("a").await.unwrap(), Some(1));
}

#[tokio::test]
async fn duplicate_transaction_keys_are_rejected() {
	init_tracing();
	let store = Store::new([("a", 1u32)]).unwrap();

	let err = store
		.transact(Multi::on(vec!["a", "a"]), |values| (values, Publish::Keep))
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::DuplicateKeys(_)));
}

// ── Randomized model comparison (deterministic xorshift) ──

struct Xorshift64(u64);

impl Xorshift64 {
	fn new(seed: u64) -> Self {
		Self(seed)
	}

	fn next(&mut self) -> u64 {
		let mut x = self.0;
		x ^= x << 13;
		x ^= x >> 7;
		x ^= x << 17;
		self.0 = x;
		x
	}

	fn next_usize(&mut self, bound: usize) -> usize {
		(self.next() % bound as u64) as usize
	}
}

const KEYS: [&str; 6] = ["k0", "k1", "k2", "k3", "k4", "k5"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_store_matches_sequential_model() {
	init_tracing();
	const OPS: usize = 1500;
	// A short idle wait so workers churn through promotion and idle death
	// while the run is in flight.
	let store = Store::builder().idle_wait(Duration::from_millis(10)).build::<&str, u32>([]).unwrap();
	let mut model: HashMap<&str, u32> = HashMap::new();
	let mut rng = Xorshift64::new(0xDEAD_BEEF);

	for op in 0..OPS {
		let key = KEYS[rng.next_usize(KEYS.len())];
		match rng.next_usize(8) {
			0 | 1 => {
				let value = (rng.next() % 1000) as u32;
				store.put(key, value).await.unwrap();
				model.insert(key, value);
			}
			2 => {
				assert_eq!(store.fetch(key).await.unwrap(), model.get(key).copied(), "op {op}: fetch {key}");
			}
			3 => {
				assert_eq!(store.pop(key).await.unwrap(), model.remove(key), "op {op}: pop {key}");
			}
			4 => {
				store.delete(key).await.unwrap();
				model.remove(key);
			}
			5 => {
				let add = (rng.next() % 100) as u32;
				let before = store
					.get_and_update(key, move |slot| {
						let before = *slot;
						*slot = Some(before.unwrap_or(0) + add);
						before
					})
					.await
					.unwrap();
				assert_eq!(before, model.get(key).copied(), "op {op}: get_and_update {key}");
				model.insert(key, before.unwrap_or(0) + add);
			}
			6 => {
				let other = KEYS[(rng.next_usize(KEYS.len() - 1) + 1 + KEYS.iter().position(|k| *k == key).unwrap()) % KEYS.len()];
				let keys = vec![key, other];
				let snapshot = store.take(keys.clone()).await.unwrap();
				let expected: HashMap<&str, u32> = keys.iter().filter_map(|k| model.get(*k).map(|v| (*k, *v))).collect();
				assert_eq!(snapshot, expected, "op {op}: take {keys:?}");
			}
			7 => {
				let other = KEYS[(rng.next_usize(KEYS.len() - 1) + 1 + KEYS.iter().position(|k| *k == key).unwrap()) % KEYS.len()];
				let keys = vec![key, other];
				let expected: Vec<Option<u32>> = keys.iter().map(|k| model.get(*k).copied()).collect();
				let seen = store
					.transact(Multi::on(keys.clone()), |values| {
						let steps = values
							.iter()
							.map(|value| match value {
								Some(v) => KeyStep::Put(v + 1),
								None => KeyStep::Keep,
							})
							.collect();
						(values, Publish::Each(steps))
					})
					.await
					.unwrap();
				assert_eq!(seen, expected, "op {op}: transact {keys:?}");
				for k in &keys {
					if let Some(v) = model.get_mut(*k) {
						*v += 1;
					}
				}
			}
			_ => unreachable!(),
		}

		// Periodically give workers room to die of idleness mid-run.
		if op % 150 == 149 {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}

	// Converge: the final store contents equal the model.
	for key in KEYS {
		assert_eq!(store.fetch(key).await.unwrap(), model.get(key).copied(), "final state for {key}");
	}
}
