//! Per-entity byte accounting.
//!
//! A [Stats] object keeps exact running totals for each configured counter, plus a set of
//! [MovingAverages] per counter. Totals are updated on every [Stats::push], but the averages are
//! only recomputed when the pending queue is flushed, which bounds the CPU cost under high packet rates.
//!
//! A flush happens when:
//! - the queue reaches `compute_throttle_max_queue_size` samples,
//! - the oldest queued sample is older than `compute_throttle_timeout`,
//! - the periodic timer fires (every `compute_throttle_timeout` while running),
//! - or [Stats::stop] is called.

use std::{
	sync::{Arc, Mutex, MutexGuard, Weak},
	time::Duration,
};

use indexmap::IndexMap;
use tokio::{
	task::JoinHandle,
	time::{Instant, MissedTickBehavior},
};

use crate::{Error, MovingAverages, Rate, StatsConfig};

/// Accounting state for a single entity: the global total, one peer, or one protocol.
///
/// This is a cheap handle; clones refer to the same underlying counters.
/// New objects start suspended and must be [Stats::start]ed to compute averages.
#[derive(Clone)]
pub struct Stats {
	state: Arc<Mutex<State>>,
}

impl Stats {
	pub fn new(config: impl Into<Arc<StatsConfig>>) -> Self {
		let state = State::new(config.into(), Instant::now());
		Self {
			state: Arc::new(Mutex::new(state)),
		}
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap()
	}

	/// Add `amount` to the named counter.
	///
	/// The total is updated immediately. The moving averages are updated on the next flush,
	/// which never happens while suspended.
	pub fn push(&self, counter: &str, amount: u64) -> Result<(), Error> {
		self.lock().push(counter, amount, Instant::now())
	}

	/// Resume computing moving averages, arming the periodic flush timer.
	pub fn start(&self) {
		let mut state = self.lock();
		state.running = true;

		if state.timer.is_none() {
			let period = state.config.compute_throttle_timeout;
			state.timer = Self::spawn_timer(Arc::downgrade(&self.state), period);
		}
	}

	/// Suspend, disarming the timer and flushing anything queued.
	pub fn stop(&self) {
		self.lock().stop(Instant::now());
	}

	fn spawn_timer(state: Weak<Mutex<State>>, period: Duration) -> Option<JoinHandle<()>> {
		if period.is_zero() {
			return None;
		}

		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			tracing::debug!("no tokio runtime, periodic flush disabled");
			return None;
		};

		let task = runtime.spawn(async move {
			let mut interval = tokio::time::interval_at(Instant::now() + period, period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				interval.tick().await;

				// The stats were dropped.
				let Some(shared) = state.upgrade() else { return };

				let mut state = shared.lock().unwrap();
				if !state.running {
					return;
				}

				state.flush(Instant::now());
			}
		});

		Some(task)
	}

	/// Fold `other`'s totals into this object, stopping both.
	///
	/// Decayed averages from two independent histories cannot be combined, so this object keeps its own
	/// moving averages and `other`'s are discarded. Totals remain exact.
	pub(crate) fn merge(&self, other: &Stats) {
		if Arc::ptr_eq(&self.state, &other.state) {
			return;
		}

		self.stop();
		other.stop();

		let totals = other.totals();
		let mut state = self.lock();

		for (counter, amount) in totals {
			if let Some(index) = state.index(&counter) {
				state.totals[index] = state.totals[index].saturating_add(amount);
			}
		}
	}

	pub fn is_running(&self) -> bool {
		self.lock().running
	}

	/// The running total for a counter, or [None] if it isn't configured.
	pub fn total(&self, counter: &str) -> Option<u64> {
		let state = self.lock();
		state.index(counter).map(|index| state.totals[index])
	}

	/// Every counter's running total, in configured order.
	pub fn totals(&self) -> IndexMap<String, u64> {
		let state = self.lock();
		state.config.counters.iter().cloned().zip(state.totals.iter().copied()).collect()
	}

	/// Every counter's moving averages, one [Rate] per configured interval.
	pub fn moving_averages(&self) -> IndexMap<String, Vec<Rate>> {
		let state = self.lock();
		state
			.config
			.counters
			.iter()
			.cloned()
			.zip(state.averages.iter().map(MovingAverages::rates))
			.collect()
	}

	/// The number of samples waiting for the next flush.
	pub fn queue_len(&self) -> usize {
		self.lock().queue.len()
	}
}

impl std::fmt::Debug for Stats {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("Stats")
			.field("running", &state.running)
			.field("totals", &state.totals)
			.field("queued", &state.queue.len())
			.field("last_flush", &state.last_flush)
			.finish()
	}
}

struct Sample {
	// Index into the configured counters.
	counter: usize,
	amount: u64,
	time: Instant,
}

struct State {
	config: Arc<StatsConfig>,
	running: bool,

	// Indexed by counter, like `config.counters`.
	totals: Vec<u64>,
	averages: Vec<MovingAverages>,

	queue: Vec<Sample>,
	last_flush: Instant,
	timer: Option<JoinHandle<()>>,
}

impl State {
	fn new(config: Arc<StatsConfig>, now: Instant) -> Self {
		let counters = config.counters.len();
		let averages = (0..counters)
			.map(|_| MovingAverages::new(&config.moving_average_intervals, now))
			.collect();

		Self {
			totals: vec![0; counters],
			averages,
			queue: Vec::new(),
			last_flush: now,
			running: false,
			timer: None,
			config,
		}
	}

	fn index(&self, counter: &str) -> Option<usize> {
		self.config.counters.iter().position(|name| name == counter)
	}

	fn push(&mut self, counter: &str, amount: u64, now: Instant) -> Result<(), Error> {
		let index = self
			.index(counter)
			.ok_or_else(|| Error::InvalidCounter(counter.to_string()))?;

		self.totals[index] = self.totals[index].saturating_add(amount);
		self.queue.push(Sample {
			counter: index,
			amount,
			time: now,
		});

		let full = self.queue.len() >= self.config.compute_throttle_max_queue_size;

		if !self.running {
			if full {
				self.compact();
			}
			return Ok(());
		}

		let stale = now.saturating_duration_since(self.queue[0].time) >= self.config.compute_throttle_timeout;
		if full || stale {
			self.flush(now);
		}

		Ok(())
	}

	// Coalesce the queue to one sample per counter so it stays bounded while suspended.
	fn compact(&mut self) {
		let mut merged: Vec<Sample> = Vec::with_capacity(self.totals.len());

		for sample in self.queue.drain(..) {
			match merged.iter_mut().find(|existing| existing.counter == sample.counter) {
				Some(existing) => {
					existing.amount = existing.amount.saturating_add(sample.amount);
					existing.time = sample.time;
				}
				None => merged.push(sample),
			}
		}

		self.queue = merged;
	}

	fn flush(&mut self, now: Instant) {
		let mut amounts = vec![0u64; self.totals.len()];
		let samples = self.queue.len();

		for sample in self.queue.drain(..) {
			amounts[sample.counter] = amounts[sample.counter].saturating_add(sample.amount);
		}

		// Idle counters are updated too, so their rates decay.
		for (averages, amount) in self.averages.iter_mut().zip(amounts) {
			averages.update(amount, now);
		}

		self.last_flush = now;
		tracing::trace!(samples, "flushed stats");
	}

	fn stop(&mut self, now: Instant) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}

		// Averages stay frozen while suspended.
		if !std::mem::replace(&mut self.running, false) {
			return;
		}

		self.flush(now);
	}
}

impl Drop for State {
	fn drop(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{RECEIVED, SENT};

	fn config(queue: usize, timeout: Duration) -> StatsConfig {
		StatsConfig {
			counters: vec![RECEIVED.to_string(), SENT.to_string()],
			compute_throttle_max_queue_size: queue,
			compute_throttle_timeout: timeout,
			moving_average_intervals: vec![Duration::from_secs(60), Duration::from_secs(300)],
		}
	}

	fn average(stats: &Stats, counter: &str) -> f64 {
		stats.moving_averages()[counter][0].average
	}

	#[test]
	fn test_unknown_counter() {
		let stats = Stats::new(StatsConfig::default());
		stats.push(RECEIVED, 10).unwrap();

		assert_eq!(stats.push("bogus", 5), Err(Error::InvalidCounter("bogus".to_string())));
		assert_eq!(stats.total(RECEIVED), Some(10));
		assert_eq!(stats.total("bogus"), None);
		assert_eq!(stats.queue_len(), 1);
	}

	#[test]
	fn test_totals_exact_across_cycles() {
		let stats = Stats::new(config(3, Duration::from_secs(2)));

		let mut expected = 0;
		for round in 0..5u64 {
			stats.start();
			for i in 0..7 {
				stats.push(RECEIVED, round * 10 + i).unwrap();
				expected += round * 10 + i;
			}
			stats.stop();

			stats.push(RECEIVED, 1).unwrap();
			expected += 1;
		}

		assert_eq!(stats.total(RECEIVED), Some(expected));
		assert_eq!(stats.total(SENT), Some(0));

		let totals = stats.totals();
		assert_eq!(totals.keys().collect::<Vec<_>>(), vec![RECEIVED, SENT]);
		assert_eq!(totals[RECEIVED], expected);
	}

	#[test]
	fn test_suspended_does_not_flush() {
		let stats = Stats::new(config(2, Duration::from_secs(2)));
		let start = stats.lock().last_flush;

		{
			let mut state = stats.lock();
			for i in 0..10 {
				state.push(SENT, 100, start + Duration::from_secs(i)).unwrap();
			}
		}

		// Compacted instead of flushed.
		assert_eq!(stats.queue_len(), 1);
		assert_eq!(stats.lock().last_flush, start);
		assert_eq!(average(&stats, SENT), 0.0);
		assert_eq!(stats.total(SENT), Some(1000));
	}

	#[test]
	fn test_flush_on_queue_size() {
		let stats = Stats::new(config(3, Duration::from_secs(60)));
		let start = stats.lock().last_flush;
		let now = start + Duration::from_secs(1);

		stats.start();
		let mut state = stats.lock();
		state.push(RECEIVED, 100, now).unwrap();
		state.push(RECEIVED, 100, now).unwrap();
		assert_eq!(state.queue.len(), 2);

		state.push(SENT, 100, now).unwrap();
		assert!(state.queue.is_empty());
		assert_eq!(state.last_flush, now);

		assert_eq!(state.averages[0].rates()[0].average, 200.0);
		assert_eq!(state.averages[1].rates()[0].average, 100.0);
	}

	#[test]
	fn test_flush_on_elapsed() {
		let stats = Stats::new(config(1000, Duration::from_secs(2)));
		let start = stats.lock().last_flush;

		stats.start();
		let mut state = stats.lock();
		state.push(RECEIVED, 400, start + Duration::from_secs(1)).unwrap();
		state.push(RECEIVED, 400, start + Duration::from_secs(2)).unwrap();
		assert_eq!(state.queue.len(), 2);

		// The oldest sample is now two seconds old.
		state.push(RECEIVED, 400, start + Duration::from_secs(3)).unwrap();
		assert!(state.queue.is_empty());
		assert_eq!(state.averages[0].rates()[0].average, 400.0);
	}

	#[test]
	fn test_stop_flushes() {
		let stats = Stats::new(config(1000, Duration::from_secs(60)));
		let start = stats.lock().last_flush;

		stats.start();
		stats.lock().push(RECEIVED, 500, start).unwrap();
		stats.lock().stop(start + Duration::from_secs(1));

		assert!(!stats.is_running());
		assert_eq!(stats.queue_len(), 0);
		assert_eq!(average(&stats, RECEIVED), 500.0);
	}

	#[test]
	fn test_stop_idempotent() {
		let stats = Stats::new(StatsConfig::default());
		stats.stop();
		stats.stop();
		assert!(!stats.is_running());

		stats.start();
		stats.start();
		assert!(stats.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn test_suspended_averages_frozen() {
		let stats = Stats::new(config(1000, Duration::from_secs(2)));

		stats.start();
		stats.push(RECEIVED, 6000).unwrap();
		tokio::time::advance(Duration::from_secs(1)).await;
		stats.stop();

		let before = stats.moving_averages();
		let flushed = stats.lock().last_flush;
		assert_eq!(before[RECEIVED][0].average, 6000.0);

		// Stopping again after a long idle gap must not decay anything.
		tokio::time::advance(Duration::from_secs(600)).await;
		stats.stop();

		assert_eq!(stats.moving_averages(), before);
		assert_eq!(stats.lock().last_flush, flushed);
		assert!(!stats.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn test_resume_after_suspend() {
		let stats = Stats::new(config(1000, Duration::from_secs(2)));

		stats.push(RECEIVED, 1000).unwrap();
		tokio::time::advance(Duration::from_secs(1)).await;
		assert_eq!(average(&stats, RECEIVED), 0.0);

		stats.start();
		assert_eq!(average(&stats, RECEIVED), 0.0);

		stats.stop();
		assert_eq!(average(&stats, RECEIVED), 1000.0);
		assert_eq!(stats.total(RECEIVED), Some(1000));
	}

	#[tokio::test(start_paused = true)]
	async fn test_periodic_flush() {
		let stats = Stats::new(config(1000, Duration::from_secs(2)));
		stats.start();

		stats.push(SENT, 100).unwrap();
		assert_eq!(stats.queue_len(), 1);

		tokio::time::sleep(Duration::from_millis(2001)).await;

		assert_eq!(stats.queue_len(), 0);
		assert_eq!(average(&stats, SENT), 50.0);
		assert_eq!(average(&stats, RECEIVED), 0.0);

		// No more ticks once stopped.
		stats.stop();
		let flushed = stats.lock().last_flush;
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(stats.lock().last_flush, flushed);
	}

	#[tokio::test(start_paused = true)]
	async fn test_idle_rate_decays() {
		let stats = Stats::new(config(1000, Duration::from_secs(2)));
		stats.start();

		for _ in 0..30 {
			stats.push(RECEIVED, 2000).unwrap();
			tokio::time::sleep(Duration::from_millis(2001)).await;
		}

		let busy = average(&stats, RECEIVED);
		assert!(busy > 900.0, "{busy}");

		tokio::time::sleep(Duration::from_secs(120)).await;

		let idle = average(&stats, RECEIVED);
		assert!(idle < busy / 2.0, "busy={busy} idle={idle}");
		assert!(idle >= 0.0);
	}

	#[test]
	fn test_merge_sums_totals() {
		let config = Arc::new(config(1000, Duration::from_secs(2)));
		let target = Stats::new(config.clone());
		let other = Stats::new(config);

		target.start();
		other.start();

		target.push(RECEIVED, 100).unwrap();
		target.push(SENT, 5).unwrap();
		other.push(RECEIVED, 20).unwrap();

		target.merge(&other);

		assert_eq!(target.total(RECEIVED), Some(120));
		assert_eq!(target.total(SENT), Some(5));
		assert!(!target.is_running());
		assert!(!other.is_running());

		// Merging with yourself must not double count.
		target.merge(&target.clone());
		assert_eq!(target.total(RECEIVED), Some(120));
	}
}
