//! Outbound publishing: route resolution, request/reply correlation and the
//! pending queue that rides out disconnected windows.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use arcstr::ArcStr;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::error::BusError;
use crate::serializer::SerializationStrategy;
use crate::subscription::key::short_type_name;
use crate::transport::{
	Connection, Delivery, Headers, Publication, TransportError,
};

/// Correlation identifier tying a reply to its request.
pub type CorrelationId = ArcStr;

/// A publication buffered because no connection was available when it was
/// made. Flushed in FIFO order once a connection exists.
pub type PendingPublication = Publication;

/// Outbound route for one message type.
#[derive(Debug, Clone)]
pub struct PublicationRoute {
	/// Routing key publications of this type are sent with.
	pub routing_key: ArcStr,
	/// Headers attached to every publication of this type.
	pub headers: Option<Headers>,
}

impl PublicationRoute {
	/// Creates a route with no default headers.
	pub fn new(routing_key: impl Into<ArcStr>) -> Self {
		Self {
			routing_key: routing_key.into(),
			headers: None,
		}
	}

	/// Attaches default headers to this route.
	pub fn with_headers(mut self, headers: Headers) -> Self {
		self.headers = Some(headers);
		self
	}
}

/// Publication-route configuration, indexed by message type. Unconfigured
/// types publish to a route derived from the type name.
#[derive(Debug, Default)]
pub struct RouteTable {
	routes: HashMap<&'static str, PublicationRoute>,
}

impl RouteTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the outbound route for message type `T`.
	pub fn insert<T>(&mut self, route: PublicationRoute) {
		self.routes.insert(std::any::type_name::<T>(), route);
	}

	/// Resolves the route for a message type identifier.
	pub fn resolve(&self, message_type: &'static str) -> PublicationRoute {
		match self.routes.get(message_type) {
			| Some(route) => route.clone(),
			| None => {
				PublicationRoute::new(short_type_name(message_type))
			}
		}
	}
}

/// Context handed to a reply callback, wrapping the deserialized reply.
#[derive(Debug)]
pub struct ReplyContext<T> {
	/// The deserialized reply message.
	pub message: T,
	/// Correlation id the reply arrived with.
	pub correlation_id: CorrelationId,
	/// Routing key the reply was published to.
	pub routing_key: ArcStr,
	/// Headers carried by the reply.
	pub headers: Option<Headers>,
}

type ErasedReply = Box<dyn FnOnce(Delivery) + Send>;

struct PublisherState {
	connection: Option<Arc<dyn Connection>>,
	pending: VecDeque<PendingPublication>,
	closed: bool,
}

/// Publishes typed messages, surviving connection churn.
///
/// While disconnected, publications queue in FIFO order; the connection
/// manager calls [`set_connection`](Self::set_connection) and
/// [`flush`](Self::flush) once a connection is (re)established. The
/// send-or-queue decision and the queue itself live under one lock, so a
/// message can never be both queued and sent.
pub struct MessagePublisher<S> {
	serializer: S,
	routes: RouteTable,
	reply_route: ArcStr,
	state: Mutex<PublisherState>,
	replies: Arc<Mutex<HashMap<CorrelationId, ErasedReply>>>,
	reply_pump: Mutex<Option<JoinHandle<()>>>,
}

impl<S> MessagePublisher<S>
where S: Clone + Send + Sync + 'static
{
	/// Creates a disconnected publisher.
	pub fn new(serializer: S, routes: RouteTable) -> Self {
		Self {
			serializer,
			routes,
			reply_route: ArcStr::from(format!("reply.{}", Uuid::new_v4())),
			state: Mutex::new(PublisherState {
				connection: None,
				pending: VecDeque::new(),
				closed: false,
			}),
			replies: Arc::new(Mutex::new(HashMap::new())),
			reply_pump: Mutex::new(None),
		}
	}

	/// The private routing key replies to this publisher arrive on.
	pub fn reply_route(&self) -> &ArcStr {
		&self.reply_route
	}

	/// Publishes a message, resolving its route from the table unless
	/// `routing_key`/`headers` override it. Queues the publication when no
	/// connection is available.
	pub async fn publish<T>(
		&self,
		message: &T,
		routing_key: Option<ArcStr>,
		headers: Option<Headers>,
	) -> Result<(), BusError>
	where
		S: SerializationStrategy<T>,
	{
		let publication =
			self.build_publication(message, routing_key, headers)?;
		self.dispatch(publication).await
	}

	/// Publishes a request and registers `on_reply` for the correlated
	/// response. The callback fires at most once, when a reply carrying the
	/// returned correlation id arrives on this publisher's reply route.
	pub async fn publish_request<TReq, TRep, F>(
		&self,
		message: &TReq,
		routing_key: Option<ArcStr>,
		headers: Option<Headers>,
		on_reply: F,
	) -> Result<CorrelationId, BusError>
	where
		S: SerializationStrategy<TReq> + SerializationStrategy<TRep>,
		TRep: Send + 'static,
		F: FnOnce(ReplyContext<TRep>) + Send + 'static,
	{
		let correlation_id: CorrelationId =
			ArcStr::from(Uuid::new_v4().to_string());

		let serializer = self.serializer.clone();
		let erased: ErasedReply = Box::new(move |delivery: Delivery| {
			match SerializationStrategy::<TRep>::deserialize(
				&serializer,
				&delivery.payload,
			) {
				| Ok(reply) => on_reply(ReplyContext {
					message: reply,
					correlation_id: delivery
						.correlation_id
						.clone()
						.unwrap_or_default(),
					routing_key: delivery.routing_key.clone(),
					headers: delivery.headers.clone(),
				}),
				| Err(err) => {
					warn!(
						correlation_id = ?delivery.correlation_id,
						error = ?err,
						"failed to deserialize reply, callback dropped"
					);
				}
			}
		});
		self.replies
			.lock()
			.await
			.insert(correlation_id.clone(), erased);

		let mut publication =
			self.build_publication(message, routing_key, headers)?;
		publication.correlation_id = Some(correlation_id.clone());
		publication.reply_to = Some(self.reply_route.clone());

		if let Err(err) = self.dispatch(publication).await {
			// The request never left, so the reply can never arrive.
			self.replies.lock().await.remove(&correlation_id);
			return Err(err);
		}
		Ok(correlation_id)
	}

	fn build_publication<T>(
		&self,
		message: &T,
		routing_key: Option<ArcStr>,
		headers: Option<Headers>,
	) -> Result<Publication, BusError>
	where
		S: SerializationStrategy<T>,
	{
		let route = self.routes.resolve(std::any::type_name::<T>());
		let payload = self
			.serializer
			.serialize(message)
			.map_err(|e| BusError::Serialization(format!("{e:?}")))?;
		Ok(Publication {
			routing_key: routing_key.unwrap_or(route.routing_key),
			headers: headers.or(route.headers),
			payload: Bytes::from(payload),
			correlation_id: None,
			reply_to: None,
		})
	}

	/// Sends immediately when a connection is present, queues otherwise.
	async fn dispatch(
		&self,
		publication: Publication,
	) -> Result<(), BusError> {
		let connection = {
			let mut state = self.state.lock().await;
			if state.closed {
				return Err(BusError::Closed);
			}
			match state.connection.clone().filter(|c| c.is_open()) {
				| Some(connection) => connection,
				| None => {
					debug!(
						routing_key = %publication.routing_key,
						pending = state.pending.len() + 1,
						"no connection, publication queued"
					);
					state.pending.push_back(publication);
					return Ok(());
				}
			}
		};
		match connection.publish(publication.clone()).await {
			| Ok(()) => Ok(()),
			| Err(TransportError::ConnectionClosed) => {
				// Lost the connection between the check and the send.
				warn!(
					routing_key = %publication.routing_key,
					"connection lost mid-publish, publication queued"
				);
				self.state.lock().await.pending.push_back(publication);
				// A reconnect may have completed between the failed send and
				// the requeue; drain again so the late arrival does not wait
				// for the next reconnect.
				self.flush().await;
				Ok(())
			}
			| Err(err) => Err(err.into()),
		}
	}

	/// Swaps the connection used for immediate sends. Does not flush.
	pub async fn set_connection(&self, connection: Arc<dyn Connection>) {
		self.state.lock().await.connection = Some(connection);
	}

	/// Starts the reply consumer on `connection`, replacing any previous
	/// listener. Called by the connection manager on every (re)connect.
	pub async fn bind_reply_listener(
		&self,
		connection: &Arc<dyn Connection>,
	) -> Result<(), TransportError> {
		let mut receiver = connection
			.consume(crate::transport::ConsumeRoute {
				routing_key: self.reply_route.clone(),
				headers: None,
			})
			.await?;
		let replies = Arc::clone(&self.replies);
		let pump_connection = Arc::clone(connection);
		let pump = tokio::spawn(async move {
			while let Some(delivery) = receiver.recv().await {
				let callback = match &delivery.correlation_id {
					| Some(id) => replies.lock().await.remove(id),
					| None => None,
				};
				match callback {
					| Some(callback) => {
						if let Err(err) = pump_connection
							.ack(delivery.delivery_tag)
							.await
						{
							warn!(error = %err, "failed to ack reply");
						}
						callback(delivery);
					}
					| None => {
						warn!(
							correlation_id = ?delivery.correlation_id,
							"reply without a waiting request, rejected"
						);
						if let Err(err) = pump_connection
							.reject(delivery.delivery_tag, false)
							.await
						{
							warn!(error = %err, "failed to reject reply");
						}
					}
				}
			}
		});
		if let Some(previous) = self.reply_pump.lock().await.replace(pump) {
			previous.abort();
		}
		Ok(())
	}

	/// Drains the pending queue in FIFO order over the current connection.
	/// A mid-drain failure pushes the item back to the front and stops, so
	/// nothing is reordered or dropped; the next flush retries it.
	pub async fn flush(&self) {
		let mut flushed = 0usize;
		loop {
			let (connection, publication) = {
				let mut state = self.state.lock().await;
				let connection =
					match state.connection.clone().filter(|c| c.is_open()) {
						| Some(connection) => connection,
						| None => break,
					};
				match state.pending.pop_front() {
					| Some(publication) => (connection, publication),
					| None => break,
				}
			};
			match connection.publish(publication.clone()).await {
				| Ok(()) => flushed += 1,
				| Err(err) => {
					warn!(
						error = %err,
						routing_key = %publication.routing_key,
						"flush interrupted, publication re-queued"
					);
					self.state.lock().await.pending.push_front(publication);
					break;
				}
			}
		}
		if flushed > 0 {
			debug!(flushed, "pending publications flushed");
		}
	}

	/// Number of publications waiting for a connection.
	pub async fn pending_count(&self) -> usize {
		self.state.lock().await.pending.len()
	}

	/// Stops the reply listener, drops waiting reply registrations and
	/// refuses further publications. Called on close.
	pub async fn shutdown(&self) {
		self.state.lock().await.closed = true;
		self.replies.lock().await.clear();
		if let Some(pump) = self.reply_pump.lock().await.take() {
			pump.abort();
		}
	}
}
