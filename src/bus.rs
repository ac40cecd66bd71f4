//! The public bus façade.

use std::future::Future;
use std::sync::Arc;

use arcstr::ArcStr;
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::{
	ConnectionConfig, ConnectionEstablished, ConnectionManagerActor,
	ConnectionManagerHandle,
};
use crate::dead_letter::{DeadLetterStrategy, RepublishDeadLetterStrategy};
use crate::publisher::{CorrelationId, MessagePublisher, ReplyContext};
use crate::serializer::{JsonSerializer, SerializationStrategy};
use crate::subscription::registry::SubscriptionRegistry;
use crate::subscription::{
	ConsumeError, ErasedHandler, ErrorCallback, FnHandler, Handler,
	Subscription, SubscriptionKey, TypedHandler,
};
use crate::transport::{Connector, Endpoint, Headers};

pub mod config;
pub mod error;

use config::{BusConfig, HandlerRegistration};
use error::BusError;

const ESTABLISHED_CHANNEL_CAPACITY: usize = 16;

/// Resilient typed pub/sub bus.
///
/// Composes the connection owner, subscription registry and publisher behind
/// one API: publish typed messages, subscribe typed handlers, and let the
/// bus ride out connection loss. Cloning is cheap; clones share the same
/// connection and subscriptions.
#[derive(Clone)]
pub struct MessageBus<S = JsonSerializer> {
	manager: ConnectionManagerHandle,
	registry: Arc<SubscriptionRegistry>,
	publisher: Arc<MessagePublisher<S>>,
	dead_letter: Arc<dyn DeadLetterStrategy>,
	established_tx: broadcast::Sender<ConnectionEstablished>,
	registrations: Arc<Vec<HandlerRegistration>>,
	serializer: S,
}

impl<S> MessageBus<S>
where S: Default + Clone + Send + Sync + 'static
{
	/// Creates a disconnected bus over `connector`. Call
	/// [`connect`](Self::connect) before publishing or subscribing takes
	/// effect on a broker.
	pub fn new(connector: Arc<dyn Connector>, config: BusConfig<S>) -> Self {
		let (established_tx, _) =
			broadcast::channel(ESTABLISHED_CHANNEL_CAPACITY);
		let registry = Arc::new(SubscriptionRegistry::new());
		let publisher =
			Arc::new(MessagePublisher::new(S::default(), config.routes));
		let dead_letter: Arc<dyn DeadLetterStrategy> = Arc::new(
			RepublishDeadLetterStrategy::new(config.dead_letter_route),
		);
		let manager = ConnectionManagerActor::spawn(
			connector,
			ConnectionConfig {
				uri: config.uri,
				reconnect_delay: config.reconnect_delay,
			},
			Arc::clone(&registry),
			Arc::clone(&publisher),
			Arc::clone(&dead_letter),
			established_tx.clone(),
		);
		Self {
			manager,
			registry,
			publisher,
			dead_letter,
			established_tx,
			registrations: Arc::new(config.registrations),
			serializer: S::default(),
		}
	}

	/// Creates a bus backed by a fresh in-process broker. Intended for tests
	/// and demos; the returned broker exposes the fault-injection hooks.
	pub fn in_memory(
		config: BusConfig<S>,
	) -> (Self, crate::transport::memory::MemoryBroker) {
		let broker = crate::transport::memory::MemoryBroker::new();
		let bus = Self::new(Arc::new(broker.connector()), config);
		(bus, broker)
	}

	/// Connects to the configured broker URI and subscribes every handler
	/// registered on the config.
	pub async fn connect(&self) -> Result<Endpoint, BusError> {
		self.connect_inner(None).await
	}

	/// Connects to `uri` instead of the configured URI. Reconnect attempts
	/// reuse the last successfully dialed URI.
	pub async fn connect_to(
		&self,
		uri: impl Into<String>,
	) -> Result<Endpoint, BusError> {
		self.connect_inner(Some(uri.into())).await
	}

	async fn connect_inner(
		&self,
		uri: Option<String>,
	) -> Result<Endpoint, BusError> {
		let endpoint = self.manager.connect(uri).await?;
		self.bootstrap_registrations().await?;
		Ok(endpoint)
	}

	/// Replays the auto-subscription table through the internal subscribe
	/// path, so table entries get the same renewal and error semantics as
	/// explicit subscriptions.
	async fn bootstrap_registrations(&self) -> Result<(), BusError> {
		for registration in self.registrations.iter() {
			let result = self
				.subscribe_entry(
					registration.key.clone(),
					Arc::clone(&registration.handler),
					None,
				)
				.await;
			match result {
				| Ok(()) => {}
				| Err(BusError::DuplicateSubscription(dup)) => {
					// A second explicit connect already replayed the table.
					debug!(
						key = %dup.0,
						"auto-subscription already registered, skipping"
					);
				}
				| Err(err) => return Err(err),
			}
		}
		Ok(())
	}

	/// Subscribes `handler` to messages of type `T`. Fails fast with
	/// [`BusError::DuplicateSubscription`] when an equal key is already
	/// registered.
	pub async fn subscribe<T, H>(
		&self,
		handler: H,
		routing_key: Option<&str>,
		headers: Option<Headers>,
	) -> Result<(), BusError>
	where
		T: Send + 'static,
		H: Handler<T>,
		S: SerializationStrategy<T>,
	{
		self.subscribe_typed(handler, routing_key, headers, None).await
	}

	/// Subscribes with a custom error callback, invoked instead of the
	/// dead-letter strategy when the handler fails.
	pub async fn subscribe_with<T, H>(
		&self,
		handler: H,
		routing_key: Option<&str>,
		headers: Option<Headers>,
		on_error: ErrorCallback,
	) -> Result<(), BusError>
	where
		T: Send + 'static,
		H: Handler<T>,
		S: SerializationStrategy<T>,
	{
		self.subscribe_typed(handler, routing_key, headers, Some(on_error))
			.await
	}

	/// Convenience for subscribing an async closure.
	pub async fn subscribe_fn<T, F, Fut>(
		&self,
		handler: F,
		routing_key: Option<&str>,
		headers: Option<Headers>,
	) -> Result<(), BusError>
	where
		T: Send + 'static,
		F: Fn(T) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
		S: SerializationStrategy<T>,
	{
		self.subscribe::<T, _>(FnHandler(handler), routing_key, headers)
			.await
	}

	async fn subscribe_typed<T, H>(
		&self,
		handler: H,
		routing_key: Option<&str>,
		headers: Option<Headers>,
		on_error: Option<ErrorCallback>,
	) -> Result<(), BusError>
	where
		T: Send + 'static,
		H: Handler<T>,
		S: SerializationStrategy<T>,
	{
		let key =
			SubscriptionKey::of::<T>(routing_key.map(ArcStr::from), headers);
		let handler: Arc<dyn ErasedHandler> =
			Arc::new(TypedHandler::new(self.serializer.clone(), handler));
		self.subscribe_entry(key, handler, on_error).await
	}

	/// The one subscribe routine every path funnels through: explicit
	/// subscriptions and auto-registered entries alike.
	async fn subscribe_entry(
		&self,
		key: SubscriptionKey,
		handler: Arc<dyn ErasedHandler>,
		on_error: Option<ErrorCallback>,
	) -> Result<(), BusError> {
		let subscription = Subscription::new(
			key,
			handler,
			on_error,
			Arc::clone(&self.dead_letter),
		);
		self.manager.subscribe(subscription).await
	}

	/// Stops and removes the subscription for `T` under the given route
	/// options. No-op if absent.
	pub async fn unsubscribe<T>(
		&self,
		routing_key: Option<&str>,
		headers: Option<Headers>,
	) {
		let key =
			SubscriptionKey::of::<T>(routing_key.map(ArcStr::from), headers);
		self.manager.unsubscribe(key).await;
	}

	/// Publishes a message. While disconnected the publication is queued and
	/// flushed, in order, once a connection exists.
	pub async fn publish<T>(
		&self,
		message: &T,
		routing_key: Option<&str>,
		headers: Option<Headers>,
	) -> Result<(), BusError>
	where
		S: SerializationStrategy<T>,
	{
		self.publisher
			.publish(message, routing_key.map(ArcStr::from), headers)
			.await
	}

	/// Publishes a request and registers `on_reply` for the correlated
	/// typed response. The callback fires at most once.
	pub async fn publish_request<TReq, TRep, F>(
		&self,
		message: &TReq,
		on_reply: F,
	) -> Result<CorrelationId, BusError>
	where
		S: SerializationStrategy<TReq> + SerializationStrategy<TRep>,
		TRep: Send + 'static,
		F: FnOnce(ReplyContext<TRep>) + Send + 'static,
	{
		self.publisher
			.publish_request(message, None, None, on_reply)
			.await
	}

	/// Subscribes to connection-established notifications. Receivers
	/// obtained before the first connect still observe it.
	pub fn established(&self) -> broadcast::Receiver<ConnectionEstablished> {
		self.established_tx.subscribe()
	}

	/// Closes the bus permanently: stops every subscription, closes the
	/// connection and disables reconnection. Safe to call more than once.
	pub async fn close(&self) {
		self.manager.close().await;
	}

	/// Number of active subscriptions.
	pub async fn active_subscriptions(&self) -> usize {
		self.registry.len().await
	}

	/// Number of publications queued while disconnected.
	pub async fn pending_publications(&self) -> usize {
		self.publisher.pending_count().await
	}
}
