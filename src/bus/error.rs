//! Bus-level error taxonomy.
//!
//! Failures during caller-initiated actions (connect, subscribe, publish)
//! surface here synchronously. Failures during asynchronous recovery
//! (reconnect, renewal, flush) are contained and logged by the connection
//! owner instead; there is no caller waiting on that path.

use crate::subscription::registry::DuplicateSubscription;
use crate::transport::{ConnectError, TransportError};

/// Errors surfaced by the public bus API.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
	/// The initial connect could not open a connection. Fatal to the call;
	/// the bus stays unusable until connect is retried explicitly.
	#[error("failed to connect to broker: {0}")]
	Connect(#[from] ConnectError),

	/// Subscribe was called twice with an equal key.
	#[error(transparent)]
	DuplicateSubscription(#[from] DuplicateSubscription),

	/// A message body could not be serialized.
	#[error("message serialization failed: {0}")]
	Serialization(String),

	/// A transport operation on the live connection failed.
	#[error("transport operation failed: {0}")]
	Transport(#[from] TransportError),

	/// The bus has been closed; closing is permanent.
	#[error("bus has been closed")]
	Closed,
}
