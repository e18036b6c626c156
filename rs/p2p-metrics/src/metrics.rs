use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard},
};

use futures::{Stream, StreamExt};

use crate::{Direction, Error, LruCache, Message, MetricsConfig, Stats, StatsConfig, Tracked};

/// Bandwidth accounting for every peer and protocol, plus a global total.
///
/// Byte events are reported via [Metrics::on_message] (or automatically with [Metrics::track_stream]) and
/// fanned out to the global [Stats], the peer's [Stats], and the protocol's [Stats] if one was negotiated.
/// Peer and protocol stats are created on first use.
///
/// When a peer disconnects, its stats are suspended and kept in a bounded LRU cache. Later traffic for that
/// peer still adds to the cached totals but doesn't make it connected again. Traffic recorded under a
/// placeholder identity, before the remote peer is known, can later be folded into the real identity with
/// [Metrics::reconcile].
///
/// Nothing is recorded until [Metrics::start] is called.
/// This is a cheap handle; clones refer to the same registry.
#[derive(Clone)]
pub struct Metrics {
	state: Arc<Mutex<State>>,
}

impl Metrics {
	pub fn new(config: MetricsConfig) -> Result<Self, Error> {
		config.validate()?;
		Ok(Self {
			state: Arc::new(Mutex::new(State::new(config))),
		})
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap()
	}

	/// Begin recording, resuming any stats that were suspended by [Metrics::stop].
	pub fn start(&self) {
		let mut state = self.lock();
		state.running = true;

		state.global.start();
		for stats in state.peers.values().chain(state.protocols.values()) {
			stats.start();
		}

		tracing::debug!(peers = state.peers.len(), protocols = state.protocols.len(), "metrics started");
	}

	/// Stop recording and suspend every stats object, flushing anything pending.
	///
	/// Safe to call repeatedly, or before [Metrics::start].
	pub fn stop(&self) {
		let mut state = self.lock();
		let was_running = std::mem::replace(&mut state.running, false);

		state.global.stop();
		for stats in state.peers.values().chain(state.protocols.values()) {
			stats.stop();
		}

		if was_running {
			tracing::debug!("metrics stopped");
		}
	}

	pub fn is_started(&self) -> bool {
		self.lock().running
	}

	pub fn config(&self) -> MetricsConfig {
		self.lock().config.clone()
	}

	/// Record a chunk of data exchanged with a peer.
	///
	/// Ignored while stopped.
	pub fn on_message(&self, message: &Message) -> Result<(), Error> {
		self.record(
			&message.peer,
			message.protocol.as_deref(),
			message.direction,
			message.length,
		)
	}

	pub(crate) fn record(
		&self,
		peer: &str,
		protocol: Option<&str>,
		direction: Direction,
		length: u64,
	) -> Result<(), Error> {
		if peer.is_empty() || protocol.is_some_and(str::is_empty) {
			return Err(Error::EmptyIdentity);
		}

		let mut state = self.lock();
		if !state.running {
			return Ok(());
		}

		let counter = direction.counter();

		state.peer(peer).push(counter, length)?;
		state.global.push(counter, length)?;

		if let Some(protocol) = protocol {
			state.protocol(protocol).push(counter, length)?;
		}

		Ok(())
	}

	/// The stats for all traffic.
	pub fn global(&self) -> Stats {
		self.lock().global.clone()
	}

	/// The currently connected peers, sorted.
	pub fn peers(&self) -> Vec<String> {
		let mut peers: Vec<_> = self.lock().peers.keys().cloned().collect();
		peers.sort();
		peers
	}

	/// The protocols seen so far, sorted.
	pub fn protocols(&self) -> Vec<String> {
		let mut protocols: Vec<_> = self.lock().protocols.keys().cloned().collect();
		protocols.sort();
		protocols
	}

	/// The stats for a peer, whether connected or recently disconnected.
	pub fn for_peer(&self, peer: &str) -> Option<Stats> {
		self.lock().lookup(peer)
	}

	pub fn for_protocol(&self, protocol: &str) -> Option<Stats> {
		self.lock().protocols.get(protocol).cloned()
	}

	/// Called when the last connection to a peer closes.
	///
	/// The peer's stats are suspended and moved to the disconnected cache, evicting the least recently
	/// disconnected peer if the cache is full. A no-op if the peer isn't connected.
	pub fn on_peer_disconnected(&self, peer: &str) {
		let mut state = self.lock();

		let Some(stats) = state.peers.remove(peer) else {
			return;
		};

		stats.stop();
		tracing::debug!(%peer, "peer disconnected");

		if let Some((evicted, _)) = state.disconnected.insert(peer.to_string(), stats) {
			tracing::debug!(peer = %evicted, "dropped stats for disconnected peer");
		}
	}

	/// Call [Metrics::on_peer_disconnected] for every peer yielded by `events`, until it ends.
	pub async fn watch_disconnects<S>(&self, events: S)
	where
		S: Stream,
		S::Item: AsRef<str>,
	{
		let mut events = std::pin::pin!(events);
		while let Some(peer) = events.next().await {
			self.on_peer_disconnected(peer.as_ref());
		}
	}

	/// Generate a unique identity to record traffic under until the remote peer is known.
	pub fn placeholder() -> String {
		format!("placeholder-{}", hex::encode(rand::random::<[u8; 8]>()))
	}

	/// Replace a placeholder identity with the real peer identity.
	///
	/// If the peer already has stats (connected or recently disconnected), the placeholder's totals are
	/// merged into them and the peer keeps its own moving averages. Otherwise the placeholder's stats are
	/// moved over as-is. Either way the result is connected and running, and the placeholder is forgotten.
	///
	/// Ignored while stopped, or if nothing was recorded for the placeholder.
	pub fn reconcile(&self, placeholder: &str, peer: &str) -> Result<(), Error> {
		if placeholder.is_empty() || peer.is_empty() {
			return Err(Error::EmptyIdentity);
		}

		let mut state = self.lock();
		if !state.running {
			return Ok(());
		}

		let Some(stats) = state.lookup(placeholder) else {
			tracing::debug!(%placeholder, %peer, "no stats for placeholder");
			return Ok(());
		};

		let merged = match state.lookup(peer) {
			Some(existing) => {
				existing.merge(&stats);
				existing
			}
			None => stats,
		};

		state.peers.remove(placeholder);
		state.disconnected.remove(placeholder);
		state.disconnected.remove(peer);

		merged.start();
		state.peers.insert(peer.to_string(), merged);

		tracing::debug!(%placeholder, %peer, "reconciled placeholder");

		Ok(())
	}

	/// Wrap a stream so every chunk read or written is recorded.
	///
	/// If `peer` is [None], a [Metrics::placeholder] is used; see [Tracked::peer] and [Metrics::reconcile].
	pub fn track_stream<S>(&self, stream: S, peer: Option<String>, protocol: Option<String>) -> Tracked<S> {
		let peer = peer.unwrap_or_else(Self::placeholder);
		Tracked::new(stream, self.clone(), peer, protocol)
	}

	/// Register a custom metric.
	///
	/// Not implemented: always returns [Error::Unsupported].
	pub fn register_metric(&self, _name: &str) -> Result<(), Error> {
		Err(Error::Unsupported("register_metric"))
	}

	/// Register a group of custom metrics.
	///
	/// Not implemented: always returns [Error::Unsupported].
	pub fn register_metric_group(&self, _name: &str) -> Result<(), Error> {
		Err(Error::Unsupported("register_metric_group"))
	}
}

struct State {
	config: MetricsConfig,
	stats: Arc<StatsConfig>,
	running: bool,

	global: Stats,
	peers: HashMap<String, Stats>,
	protocols: HashMap<String, Stats>,

	// A peer is never both connected and in here.
	disconnected: LruCache<String, Stats>,
}

impl State {
	fn new(config: MetricsConfig) -> Self {
		let stats = Arc::new(config.stats());

		Self {
			global: Stats::new(stats.clone()),
			peers: HashMap::new(),
			protocols: HashMap::new(),
			disconnected: LruCache::new(config.max_old_peers_retention),
			running: false,
			stats,
			config,
		}
	}

	fn lookup(&self, peer: &str) -> Option<Stats> {
		self.peers.get(peer).or_else(|| self.disconnected.get(peer)).cloned()
	}

	// Get the stats to record a peer's traffic in, creating them if needed.
	// A disconnected peer stays in the cache, suspended, but is marked as recently used.
	fn peer(&mut self, peer: &str) -> Stats {
		if let Some(stats) = self.peers.get(peer) {
			return stats.clone();
		}

		if let Some(stats) = self.disconnected.refresh(peer) {
			tracing::trace!(%peer, "traffic for disconnected peer");
			return stats.clone();
		}

		tracing::trace!(%peer, "tracking peer");

		let stats = Stats::new(self.stats.clone());
		stats.start();
		self.peers.insert(peer.to_string(), stats.clone());
		stats
	}

	fn protocol(&mut self, protocol: &str) -> Stats {
		if let Some(stats) = self.protocols.get(protocol) {
			return stats.clone();
		}

		tracing::trace!(%protocol, "tracking protocol");

		let stats = Stats::new(self.stats.clone());
		stats.start();
		self.protocols.insert(protocol.to_string(), stats.clone());
		stats
	}
}
