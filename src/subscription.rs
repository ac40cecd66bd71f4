//! Subscription model: typed handlers, their type-erased form, and the
//! lifecycle of one live consumer binding.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dead_letter::DeadLetterStrategy;
use crate::serializer::SerializationStrategy;
use crate::transport::{Connection, Delivery, TransportError};

pub mod key;
pub mod registry;

pub use key::SubscriptionKey;

/// Error returned by a message handler. The delivery is rejected without
/// requeue and handed to the error callback or the dead-letter strategy.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConsumeError(String);

impl ConsumeError {
	/// Creates an error from any printable detail.
	pub fn new(detail: impl Into<String>) -> Self {
		Self(detail.into())
	}
}

impl From<&str> for ConsumeError {
	fn from(detail: &str) -> Self {
		Self(detail.to_string())
	}
}

impl From<String> for ConsumeError {
	fn from(detail: String) -> Self {
		Self(detail)
	}
}

/// Typed message handler.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
	/// Processes one deserialized message.
	async fn handle(&self, message: T) -> Result<(), ConsumeError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
	T: Send + 'static,
	F: Fn(T) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
	async fn handle(&self, message: T) -> Result<(), ConsumeError> {
		(self.0)(message).await
	}
}

/// Per-subscription error callback, invoked instead of the dead-letter
/// strategy when the handler fails.
pub type ErrorCallback =
	Arc<dyn Fn(&SubscriptionKey, &ConsumeError) + Send + Sync>;

/// Type-erased handler: deserialize-and-invoke behind one object-safe trait,
/// so subscriptions are keyed and renewed uniformly regardless of the
/// concrete payload type.
#[async_trait]
pub trait ErasedHandler: Send + Sync + 'static {
	/// Deserializes the delivery payload and runs the typed handler.
	async fn handle(&self, delivery: &Delivery) -> Result<(), ConsumeError>;
}

/// Glues a typed handler and a serialization strategy into an
/// [`ErasedHandler`].
pub(crate) struct TypedHandler<T, S, H> {
	serializer: S,
	handler: H,
	_message: PhantomData<fn() -> T>,
}

impl<T, S, H> TypedHandler<T, S, H> {
	pub(crate) fn new(serializer: S, handler: H) -> Self {
		Self {
			serializer,
			handler,
			_message: PhantomData,
		}
	}
}

#[async_trait]
impl<T, S, H> ErasedHandler for TypedHandler<T, S, H>
where
	T: Send + 'static,
	S: SerializationStrategy<T>,
	H: Handler<T>,
{
	async fn handle(&self, delivery: &Delivery) -> Result<(), ConsumeError> {
		let message =
			self.serializer.deserialize(&delivery.payload).map_err(|e| {
				ConsumeError::new(format!(
					"failed to deserialize payload on {}: {e:?}",
					delivery.routing_key
				))
			})?;
		self.handler.handle(message).await
	}
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	/// Registered but not yet bound to a connection.
	Created,
	/// Consumer bound and pumping deliveries.
	Started,
	/// Stopped by unsubscribe or close; terminal.
	Stopped,
}

impl fmt::Display for SubscriptionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			| Self::Created => f.write_str("created"),
			| Self::Started => f.write_str("started"),
			| Self::Stopped => f.write_str("stopped"),
		}
	}
}

/// One live consumer binding.
///
/// The connection reference is borrowed, never owned: renewal rebinds the
/// consumer against a new connection while preserving the key and handler.
pub struct Subscription {
	key: SubscriptionKey,
	handler: Arc<dyn ErasedHandler>,
	on_error: Option<ErrorCallback>,
	dead_letter: Arc<dyn DeadLetterStrategy>,
	state: SubscriptionState,
	pump: Option<JoinHandle<()>>,
}

impl Subscription {
	/// Creates a subscription in the `Created` state.
	pub(crate) fn new(
		key: SubscriptionKey,
		handler: Arc<dyn ErasedHandler>,
		on_error: Option<ErrorCallback>,
		dead_letter: Arc<dyn DeadLetterStrategy>,
	) -> Self {
		Self {
			key,
			handler,
			on_error,
			dead_letter,
			state: SubscriptionState::Created,
			pump: None,
		}
	}

	/// The identity of this subscription.
	pub fn key(&self) -> &SubscriptionKey {
		&self.key
	}

	/// Current lifecycle state.
	pub fn state(&self) -> SubscriptionState {
		self.state
	}

	/// Binds the consumer against `connection` and starts pumping deliveries.
	pub(crate) async fn start(
		&mut self,
		connection: &Arc<dyn Connection>,
	) -> Result<(), TransportError> {
		self.bind(connection).await
	}

	/// Rebinds the consumer against a fresh connection, preserving the key
	/// and handler. The previous binding is discarded; its connection is
	/// already gone.
	pub(crate) async fn renew(
		&mut self,
		connection: &Arc<dyn Connection>,
	) -> Result<(), TransportError> {
		debug!(key = %self.key, "renewing subscription");
		self.bind(connection).await
	}

	async fn bind(
		&mut self,
		connection: &Arc<dyn Connection>,
	) -> Result<(), TransportError> {
		let receiver = connection.consume(self.key.consume_route()).await?;
		if let Some(pump) = self.pump.take() {
			pump.abort();
		}
		self.pump = Some(tokio::spawn(pump_deliveries(
			receiver,
			Arc::clone(connection),
			Arc::clone(&self.handler),
			self.on_error.clone(),
			Arc::clone(&self.dead_letter),
			self.key.clone(),
		)));
		self.state = SubscriptionState::Started;
		Ok(())
	}

	/// Stops the consumer pump. Terminal.
	pub(crate) fn stop(&mut self) {
		if let Some(pump) = self.pump.take() {
			pump.abort();
		}
		self.state = SubscriptionState::Stopped;
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(pump) = self.pump.take() {
			pump.abort();
		}
	}
}

async fn pump_deliveries(
	mut receiver: mpsc::Receiver<Delivery>,
	connection: Arc<dyn Connection>,
	handler: Arc<dyn ErasedHandler>,
	on_error: Option<ErrorCallback>,
	dead_letter: Arc<dyn DeadLetterStrategy>,
	key: SubscriptionKey,
) {
	while let Some(delivery) = receiver.recv().await {
		match handler.handle(&delivery).await {
			| Ok(()) => {
				if let Err(err) = connection.ack(delivery.delivery_tag).await
				{
					warn!(key = %key, error = %err, "failed to ack delivery");
				}
			}
			| Err(err) => {
				warn!(
					key = %key,
					error = %err,
					"handler failed, rejecting delivery without requeue"
				);
				if let Err(reject_err) =
					connection.reject(delivery.delivery_tag, false).await
				{
					warn!(
						key = %key,
						error = %reject_err,
						"failed to reject delivery"
					);
				}
				match &on_error {
					| Some(callback) => callback(&key, &err),
					| None => {
						dead_letter.dead_letter(&delivery, &err).await;
					}
				}
			}
		}
	}
	debug!(key = %key, "consumer channel closed");
}
