use crate::{RECEIVED, SENT};

/// The direction data travelled relative to the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
	In,
	Out,
}

impl Direction {
	/// The counter incremented by data in this direction.
	pub fn counter(self) -> &'static str {
		match self {
			Self::In => RECEIVED,
			Self::Out => SENT,
		}
	}
}

/// A single observed chunk of data, reported to [crate::Metrics::on_message].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
	/// The remote peer, or a placeholder if the identity isn't known yet.
	pub peer: String,

	/// The protocol negotiated on the stream, if any.
	pub protocol: Option<String>,

	pub direction: Direction,

	/// The size of the chunk in bytes.
	pub length: u64,
}

impl Message {
	pub fn new(peer: impl Into<String>, direction: Direction, length: u64) -> Self {
		Self {
			peer: peer.into(),
			protocol: None,
			direction,
			length,
		}
	}

	pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
		self.protocol = Some(protocol.into());
		self
	}
}
