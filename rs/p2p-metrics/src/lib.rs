//! # p2p-metrics: bandwidth accounting for peer-to-peer transports
//!
//! `p2p-metrics` tracks the bytes sent and received over every stream, broken down by remote peer,
//! by protocol, and globally. It exposes exact running totals as well as decayed moving averages
//! (ex. 1, 5 and 15 minute rates), computed in batches so the cost doesn't scale with packet rate.
//!
//! ## API
//!
//! - [Metrics]: The registry, owning one [Stats] for the global total and one per peer and protocol.
//! - [Stats]: The counters and [MovingAverages] for a single entity.
//! - [Tracked]: A stream wrapper, created via [Metrics::track_stream], that reports every chunk.
//!
//! To record traffic:
//! - [Metrics::new] with a [MetricsConfig], then [Metrics::start].
//! - [Metrics::track_stream] for each stream, or report chunks manually with [Metrics::on_message].
//! - [Metrics::on_peer_disconnected] when the last connection to a peer closes.
//! - [Metrics::reconcile] once the real identity behind a [Metrics::placeholder] is known.
//!
//! To query:
//! - [Metrics::global], [Metrics::for_peer] and [Metrics::for_protocol] to get a [Stats].
//! - [Stats::totals] and [Stats::moving_averages] for a snapshot.
//!
//! **NOTE**: Custom metric registration ([Metrics::register_metric]) is not implemented and always errors.

mod average;
mod cache;
mod config;
mod error;
mod message;
mod metrics;
mod stats;
mod tap;

pub use average::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use metrics::*;
pub use stats::*;
pub use tap::*;
