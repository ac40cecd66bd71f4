//! # Typed Bus
//!
//! A resilient typed pub/sub bus over a pluggable broker transport.
//!
//! ## Features
//!
//! - **Typed publish and subscribe**: handlers receive deserialized
//!   messages, publications are serialized through a pluggable strategy
//! - **Automatic reconnection**: an unexpected connection loss triggers one
//!   reconnect attempt after a configured delay
//! - **Subscription renewal**: every active subscription is rebound to the
//!   new connection after a reconnect, preserving its identity and handler
//! - **Offline queueing**: publications made while disconnected are queued
//!   and flushed in FIFO order once a connection exists
//! - **Request/reply**: correlated replies dispatched to a one-shot callback
//! - **Dead-lettering**: failed deliveries are rejected without requeue and
//!   handed to a pluggable dead-letter strategy
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use typed_bus::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug)]
//! struct OrderPlaced {
//!     id: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     // An in-process broker; implement `Connector`/`Connection` to plug
//!     // in a real broker client.
//!     let (bus, _broker) =
//!         MessageBus::<JsonSerializer>::in_memory(BusConfig::default());
//!     bus.connect().await?;
//!
//!     bus.subscribe_fn(
//!         |order: OrderPlaced| async move {
//!             println!("order placed: {}", order.id);
//!             Ok::<(), ConsumeError>(())
//!         },
//!         Some("orders.new"),
//!         None,
//!     )
//!     .await?;
//!
//!     bus.publish(&OrderPlaced { id: 7 }, Some("orders.new"), None)
//!         .await?;
//!
//!     bus.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Recovery semantics
//!
//! The sole broker connection is owned by a dedicated task; connect,
//! unexpected-shutdown handling, subscription changes and close are
//! serialized through its command channel. After a reconnect, subscriptions
//! are renewed strictly before queued publications are flushed.
//!
//! **Known limitation**: reconnection is a single attempt per shutdown
//! notification. If that attempt fails the bus stays disconnected until
//! [`MessageBus::connect`] is called again or a later shutdown notification
//! arrives; there is no retry-with-backoff loop.
//!
//! ## Custom serialization
//!
//! Implement [`SerializationStrategy`] for a custom wire format:
//!
//! ```rust
//! use typed_bus::SerializationStrategy;
//!
//! #[derive(Clone, Default)]
//! struct JsonPretty;
//!
//! impl<T> SerializationStrategy<T> for JsonPretty
//! where T: serde::Serialize + serde::de::DeserializeOwned + 'static
//! {
//!     type SerializeError = serde_json::Error;
//!     type DeserializeError = serde_json::Error;
//!
//!     fn serialize(&self, message: &T) -> Result<Vec<u8>, Self::SerializeError> {
//!         serde_json::to_vec_pretty(message)
//!     }
//!
//!     fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::DeserializeError> {
//!         serde_json::from_slice(bytes)
//!     }
//! }
//! ```

#![warn(missing_docs)]

// Core modules
pub mod bus;
pub mod connection;
pub mod dead_letter;
pub mod publisher;
pub mod serializer;
pub mod subscription;
pub mod transport;

// === Core public API ===
// The bus façade and its configuration
pub use bus::MessageBus;
pub use bus::config::{BusConfig, DEFAULT_BROKER_URI};
pub use bus::error::BusError;
pub use connection::ConnectionEstablished;
// Publishing
pub use publisher::{
	CorrelationId, PublicationRoute, ReplyContext, RouteTable,
};
// Message serialization
pub use serializer::{
	BincodeSerializer, JsonSerializer, SerializationStrategy,
};
// Subscribing
pub use subscription::{
	ConsumeError, ErrorCallback, FnHandler, Handler, SubscriptionKey,
	SubscriptionState,
};

/// Result type alias for operations that may fail with [`BusError`]
pub type Result<T> = std::result::Result<T, BusError>;

/// Prelude module for convenient imports
///
/// Essential types for most applications:
///
/// ```rust
/// use typed_bus::prelude::*;
/// ```
pub mod prelude {

	pub use crate::{
		BusConfig, BusError, ConnectionEstablished, ConsumeError, FnHandler,
		Handler, JsonSerializer, MessageBus, PublicationRoute, ReplyContext,
		Result, SerializationStrategy, SubscriptionKey,
	};
}

/// Advanced types for plugging in transports and strategies
///
/// Everything needed to implement a broker transport or a custom disposal
/// policy:
///
/// ```rust
/// use typed_bus::advanced::*;
/// ```
pub mod advanced {

	pub use crate::dead_letter::{
		DeadLetterStrategy, DiscardDeadLetterStrategy,
		RepublishDeadLetterStrategy,
	};
	pub use crate::subscription::registry::SubscriptionRegistry;
	pub use crate::transport::{
		Connection, ConnectionEvent, Connector, ConsumeRoute, Delivery,
		DeliveryTag, Endpoint, Headers, Publication, ShutdownReason,
	};
}

/// Error types used throughout the library
///
/// Re-exports all error types in one location for error handling.
pub mod errors {

	pub use crate::bus::error::BusError;
	pub use crate::subscription::ConsumeError;
	pub use crate::subscription::registry::DuplicateSubscription;
	pub use crate::transport::{ConnectError, TransportError};
}
