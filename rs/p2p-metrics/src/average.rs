use std::time::Duration;

use tokio::time::Instant;

/// An exponentially decayed estimate of a rate, in the style of the Unix load average.
///
/// Each sample is weighted by `1 - exp(-elapsed / timespan)`, so a longer timespan reacts more slowly to bursts.
#[derive(Clone, Debug)]
pub struct MovingAverage {
	timespan: Duration,
	average: f64,
	variance: f64,
	forecast: f64,
	samples: u64,
}

impl MovingAverage {
	pub fn new(timespan: Duration) -> Self {
		Self {
			timespan,
			average: 0.0,
			variance: 0.0,
			forecast: 0.0,
			samples: 0,
		}
	}

	/// Fold in a rate observed over the `elapsed` time since the previous sample.
	pub fn push(&mut self, rate: f64, elapsed: Duration) {
		if self.samples == 0 {
			self.average = rate;
			self.forecast = rate;
		} else {
			let alpha = 1.0 - (-elapsed.as_secs_f64() / self.timespan.as_secs_f64()).exp();
			let diff = rate - self.average;
			let increment = alpha * diff;

			self.average += increment;
			self.variance = (1.0 - alpha) * (self.variance + diff * increment);
			self.forecast = self.average + increment;
		}

		self.samples += 1;
	}

	pub fn timespan(&self) -> Duration {
		self.timespan
	}

	pub fn average(&self) -> f64 {
		self.average.max(0.0)
	}

	pub fn variance(&self) -> f64 {
		self.variance
	}

	pub fn deviation(&self) -> f64 {
		self.variance.sqrt()
	}

	/// The average extrapolated one step along the current trend.
	pub fn forecast(&self) -> f64 {
		self.forecast.max(0.0)
	}
}

/// A point-in-time copy of one [MovingAverage], in units per second.
#[cfg_attr(feature = "serde", serde_with::serde_as)]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Rate {
	#[cfg_attr(feature = "serde", serde(with = "serde_with::As::<serde_with::DurationMilliSeconds<u64>>"))]
	pub interval: Duration,
	pub average: f64,
	pub deviation: f64,
	pub forecast: f64,
}

impl From<&MovingAverage> for Rate {
	fn from(avg: &MovingAverage) -> Self {
		Self {
			interval: avg.timespan(),
			average: avg.average(),
			deviation: avg.deviation(),
			forecast: avg.forecast(),
		}
	}
}

/// One [MovingAverage] per configured interval, fed with raw byte amounts.
///
/// Amounts are converted to a rate using the wall-clock time since the previous update.
#[derive(Clone, Debug)]
pub struct MovingAverages {
	averages: Vec<MovingAverage>,

	// Amount not yet converted into a rate because no time has passed.
	pending: u64,
	last_update: Instant,
}

impl MovingAverages {
	pub fn new(intervals: &[Duration], now: Instant) -> Self {
		Self {
			averages: intervals.iter().copied().map(MovingAverage::new).collect(),
			pending: 0,
			last_update: now,
		}
	}

	/// Fold `amount` observed since the last update, ending at `now`.
	pub fn update(&mut self, amount: u64, now: Instant) {
		self.pending = self.pending.saturating_add(amount);

		// Nothing to divide by; keep the amount in the current bucket.
		let elapsed = now.saturating_duration_since(self.last_update);
		if elapsed.is_zero() {
			return;
		}

		let rate = self.pending as f64 / elapsed.as_secs_f64();
		for avg in &mut self.averages {
			avg.push(rate, elapsed);
		}

		self.pending = 0;
		self.last_update = now;
	}

	pub fn rates(&self) -> Vec<Rate> {
		self.averages.iter().map(Rate::from).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINUTE: Duration = Duration::from_secs(60);

	fn tick(avgs: &mut MovingAverages, now: &mut Instant, amount: u64) {
		*now += Duration::from_secs(1);
		avgs.update(amount, *now);
	}

	#[test]
	fn test_empty_reports_zero() {
		let avgs = MovingAverages::new(&[MINUTE, 5 * MINUTE], Instant::now());
		let rates = avgs.rates();

		assert_eq!(rates.len(), 2);
		assert_eq!(rates[0].interval, MINUTE);
		assert_eq!(rates[1].interval, 5 * MINUTE);
		for rate in rates {
			assert_eq!(rate.average, 0.0);
			assert_eq!(rate.deviation, 0.0);
			assert_eq!(rate.forecast, 0.0);
		}
	}

	#[test]
	fn test_first_sample_is_rate() {
		let start = Instant::now();
		let mut avgs = MovingAverages::new(&[MINUTE], start);

		avgs.update(500, start + Duration::from_millis(500));
		assert_eq!(avgs.rates()[0].average, 1000.0);
	}

	#[test]
	fn test_zero_elapsed_is_held() {
		let start = Instant::now();
		let mut avgs = MovingAverages::new(&[MINUTE], start);

		avgs.update(300, start);
		avgs.update(200, start);
		assert_eq!(avgs.rates()[0].average, 0.0);
		assert_eq!(avgs.last_update, start);

		// Both held amounts land in the next bucket.
		avgs.update(0, start + Duration::from_secs(1));
		assert_eq!(avgs.rates()[0].average, 500.0);
	}

	#[test]
	fn test_converges_to_constant_rate() {
		let mut now = Instant::now();
		let mut avgs = MovingAverages::new(&[MINUTE, 5 * MINUTE], now);

		// Start from an idle link so convergence is actually exercised.
		tick(&mut avgs, &mut now, 0);

		for _ in 0..(90 * 60) {
			tick(&mut avgs, &mut now, 1000);
		}

		for rate in avgs.rates() {
			assert!((rate.average - 1000.0).abs() < 1.0, "{rate:?}");
			assert!(rate.deviation < 1.0, "{rate:?}");
		}
	}

	#[test]
	fn test_longer_interval_reacts_slower() {
		let mut now = Instant::now();
		let mut avgs = MovingAverages::new(&[MINUTE, 15 * MINUTE], now);

		for _ in 0..60 {
			tick(&mut avgs, &mut now, 1000);
		}

		// The link goes quiet for a minute.
		for _ in 0..60 {
			tick(&mut avgs, &mut now, 0);
		}

		let rates = avgs.rates();
		let short = rates[0].average;
		let long = rates[1].average;

		assert!(short < long, "short={short} long={long}");
		assert!((short - 1000.0 * (-1.0f64).exp()).abs() < 1.0, "short={short}");
		assert!(short >= 0.0);
	}

	#[test]
	fn test_never_negative() {
		let mut avg = MovingAverage::new(Duration::from_secs(1));
		avg.push(1_000_000.0, Duration::from_secs(1));

		// A large drop with a short timespan overshoots the linear forecast.
		avg.push(0.0, Duration::from_secs(10));
		assert!(avg.average() >= 0.0);
		assert!(avg.forecast() >= 0.0);
		assert!(avg.variance() >= 0.0);
	}
}
