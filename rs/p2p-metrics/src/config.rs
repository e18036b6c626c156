use std::time::Duration;

use crate::Error;

/// Counter incremented by inbound data.
pub const RECEIVED: &str = "received";

/// Counter incremented by outbound data.
pub const SENT: &str = "sent";

/// Configuration for [crate::Metrics], applied once at construction.
#[cfg_attr(feature = "serde", serde_with::serde_as)]
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields, default))]
pub struct MetricsConfig {
	/// Flush pending samples once this many have been queued.
	pub compute_throttle_max_queue_size: usize,

	/// Flush pending samples at least this often.
	#[cfg_attr(feature = "serde", serde(with = "serde_with::As::<serde_with::DurationMilliSeconds<u64>>"))]
	pub compute_throttle_timeout: Duration,

	/// One moving average is kept per interval, per counter.
	#[cfg_attr(feature = "serde", serde(with = "serde_with::As::<Vec<serde_with::DurationMilliSeconds<u64>>>"))]
	pub moving_average_intervals: Vec<Duration>,

	/// The number of disconnected peers whose stats are retained.
	pub max_old_peers_retention: usize,
}

impl Default for MetricsConfig {
	fn default() -> Self {
		Self {
			compute_throttle_max_queue_size: 1000,
			compute_throttle_timeout: Duration::from_secs(2),
			moving_average_intervals: vec![
				Duration::from_secs(60),
				Duration::from_secs(5 * 60),
				Duration::from_secs(15 * 60),
			],
			max_old_peers_retention: 50,
		}
	}
}

impl MetricsConfig {
	pub fn validate(&self) -> Result<(), Error> {
		self.stats().validate()
	}

	/// The per-entity configuration, tracking the [RECEIVED] and [SENT] counters.
	pub fn stats(&self) -> StatsConfig {
		StatsConfig {
			counters: vec![RECEIVED.to_string(), SENT.to_string()],
			compute_throttle_max_queue_size: self.compute_throttle_max_queue_size,
			compute_throttle_timeout: self.compute_throttle_timeout,
			moving_average_intervals: self.moving_average_intervals.clone(),
		}
	}
}

/// Configuration shared by every [crate::Stats] object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsConfig {
	/// The counter names, in reporting order.
	pub counters: Vec<String>,
	pub compute_throttle_max_queue_size: usize,
	pub compute_throttle_timeout: Duration,
	pub moving_average_intervals: Vec<Duration>,
}

impl Default for StatsConfig {
	fn default() -> Self {
		MetricsConfig::default().stats()
	}
}

impl StatsConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.counters.is_empty() {
			return Err(Error::InvalidConfig("no counters"));
		}

		for (i, counter) in self.counters.iter().enumerate() {
			if counter.is_empty() {
				return Err(Error::InvalidConfig("empty counter name"));
			}

			if self.counters[..i].contains(counter) {
				return Err(Error::InvalidConfig("duplicate counter name"));
			}
		}

		if self.compute_throttle_max_queue_size == 0 {
			return Err(Error::InvalidConfig("compute_throttle_max_queue_size must be positive"));
		}

		if self.compute_throttle_timeout.is_zero() {
			return Err(Error::InvalidConfig("compute_throttle_timeout must be positive"));
		}

		if self.moving_average_intervals.iter().any(Duration::is_zero) {
			return Err(Error::InvalidConfig("moving average intervals must be positive"));
		}

		Ok(())
	}
}
