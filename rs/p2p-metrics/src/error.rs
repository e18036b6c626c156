/// Errors returned at the call boundary of the accounting engine.
///
/// Operations attempted while the engine is stopped are not errors; they are silently ignored.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
	/// The counter name is not one of the configured counters.
	#[error("unknown counter: {0}")]
	InvalidCounter(String),

	/// A peer or protocol identity was empty.
	#[error("empty identity")]
	EmptyIdentity,

	#[error("invalid config: {0}")]
	InvalidConfig(&'static str),

	/// The operation is part of the contract surface but deliberately not implemented.
	#[error("unsupported: {0}")]
	Unsupported(&'static str),
}
