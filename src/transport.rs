//! Broker transport boundary.
//!
//! The bus never speaks a wire protocol itself. Everything it needs from a
//! broker client is expressed by the [`Connector`] and [`Connection`] traits:
//! open a connection, publish, start a consumer, acknowledge deliveries, and
//! observe connection events. Implement these traits to plug in a real
//! broker client; [`memory`] provides a complete in-process implementation
//! used by the test suite and demos.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

pub mod memory;

/// Message headers, ordered by key so content comparison is stable.
pub type Headers = BTreeMap<String, String>;

/// Broker-assigned identifier for a single delivery, used to ack or reject it.
pub type DeliveryTag = u64;

/// Host and port of the broker a connection is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
	/// Broker host name or address.
	pub host: String,
	/// Broker port.
	pub port: u16,
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// An outbound message handed to the transport.
#[derive(Debug, Clone)]
pub struct Publication {
	/// Routing key selecting the consumption binding.
	pub routing_key: ArcStr,
	/// Optional application headers.
	pub headers: Option<Headers>,
	/// Serialized message body.
	pub payload: Bytes,
	/// Correlation identifier for request/reply flows.
	pub correlation_id: Option<ArcStr>,
	/// Routing key the consumer should publish its reply to.
	pub reply_to: Option<ArcStr>,
}

impl Publication {
	/// Creates a plain publication with no headers or correlation data.
	pub fn new(routing_key: ArcStr, payload: Bytes) -> Self {
		Self {
			routing_key,
			headers: None,
			payload,
			correlation_id: None,
			reply_to: None,
		}
	}
}

/// An inbound message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
	/// Routing key the message was published with.
	pub routing_key: ArcStr,
	/// Application headers carried by the message.
	pub headers: Option<Headers>,
	/// Serialized message body.
	pub payload: Bytes,
	/// Correlation identifier, present on request/reply traffic.
	pub correlation_id: Option<ArcStr>,
	/// Where the publisher expects a reply, if anywhere.
	pub reply_to: Option<ArcStr>,
	/// Tag for acknowledging or rejecting this delivery.
	pub delivery_tag: DeliveryTag,
}

/// Selects which publications a consumer receives.
#[derive(Debug, Clone)]
pub struct ConsumeRoute {
	/// Routing key to bind on.
	pub routing_key: ArcStr,
	/// When present, the delivery must also carry all of these headers.
	pub headers: Option<Headers>,
}

/// Why the broker dropped a connection.
#[derive(Debug, Clone)]
pub struct ShutdownReason(ArcStr);

impl ShutdownReason {
	/// Creates a reason from the transport's own description.
	pub fn new(detail: impl AsRef<str>) -> Self {
		Self(ArcStr::from(detail.as_ref()))
	}
}

impl fmt::Display for ShutdownReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Out-of-band notifications emitted by a connection.
///
/// The bus attaches to [`Connection::events`] exactly once per connection
/// instance, right after the connection is opened.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
	/// The broker closed the connection without the bus asking for it.
	Shutdown(ShutdownReason),
	/// The transport's own callback machinery raised an error. Logged by the
	/// bus, never rethrown.
	CallbackException(String),
}

/// Errors opening a broker connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	/// The broker refused or never answered the connection attempt.
	#[error("broker refused connection to {uri}: {detail}")]
	Refused {
		/// The URI that was dialed.
		uri: String,
		/// Transport-level detail.
		detail: String,
	},
	/// The URI could not be understood by the transport.
	#[error("invalid broker uri {uri}: {detail}")]
	InvalidUri {
		/// The offending URI.
		uri: String,
		/// What was wrong with it.
		detail: String,
	},
}

/// Errors on an established connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	/// The connection is no longer open.
	#[error("connection is closed")]
	ConnectionClosed,
	/// Starting a consumer failed.
	#[error("consume failed for {routing_key}: {detail}")]
	ConsumeFailed {
		/// Routing key the consumer tried to bind.
		routing_key: ArcStr,
		/// Transport-level detail.
		detail: String,
	},
	/// Sending a publication failed.
	#[error("publish failed for {routing_key}: {detail}")]
	PublishFailed {
		/// Routing key of the failed publication.
		routing_key: ArcStr,
		/// Transport-level detail.
		detail: String,
	},
}

/// Opens broker connections. One connector serves the whole bus lifetime;
/// reconnects go through the same instance.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
	/// Opens a new connection to the broker at `uri`.
	async fn connect(
		&self,
		uri: &str,
	) -> Result<Arc<dyn Connection>, ConnectError>;
}

/// One live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
	/// Whether the connection is still usable.
	fn is_open(&self) -> bool;

	/// The broker endpoint this connection is attached to.
	fn endpoint(&self) -> Endpoint;

	/// Closes the connection. Further operations fail with
	/// [`TransportError::ConnectionClosed`]. Does not emit a
	/// [`ConnectionEvent::Shutdown`]; that event is reserved for closures the
	/// bus did not ask for.
	async fn close(&self) -> Result<(), TransportError>;

	/// Sends one publication.
	async fn publish(
		&self,
		publication: Publication,
	) -> Result<(), TransportError>;

	/// Starts a consumer for `route`. Deliveries arrive on the returned
	/// channel until the consumer or the connection goes away.
	async fn consume(
		&self,
		route: ConsumeRoute,
	) -> Result<mpsc::Receiver<Delivery>, TransportError>;

	/// Acknowledges a delivery.
	async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

	/// Rejects a delivery, optionally asking the broker to requeue it.
	async fn reject(
		&self,
		tag: DeliveryTag,
		requeue: bool,
	) -> Result<(), TransportError>;

	/// Subscribes to out-of-band connection events.
	fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
