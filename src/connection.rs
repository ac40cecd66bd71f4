//! Connection lifecycle management.
//!
//! One owner task holds the sole broker connection and serializes every
//! lifecycle mutation (connect, unexpected shutdown, subscribe, unsubscribe,
//! close) through a single command channel. Processing commands one at a
//! time gives the recovery path its ordering guarantees: a reconnect renews
//! every subscription before the publisher flushes, and nothing observes a
//! connection mid-transition.
//!
//! Reconnection is a single attempt per shutdown notification, made after a
//! configured delay. A failed attempt leaves the bus disconnected until the
//! next explicit connect; there is no retry loop. This is a known limitation
//! of the recovery design, not a liveness guarantee.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::error::BusError;
use crate::dead_letter::DeadLetterStrategy;
use crate::publisher::MessagePublisher;
use crate::subscription::registry::SubscriptionRegistry;
use crate::subscription::{Subscription, SubscriptionKey};
use crate::transport::{
	Connection, ConnectionEvent, Connector, Endpoint, ShutdownReason,
};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Broadcast to observers every time a connection is (re)established.
///
/// Receivers obtained before the first connect still see the first event;
/// the channel exists from bus construction.
#[derive(Debug, Clone)]
pub struct ConnectionEstablished {
	/// Endpoint of the freshly opened connection.
	pub endpoint: Endpoint,
}

/// Connection-owner settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	/// Broker URI dialed on connect and on reconnect attempts.
	pub uri: String,
	/// Delay between an unexpected shutdown and the reconnect attempt.
	pub reconnect_delay: Duration,
}

pub(crate) enum Command {
	Connect {
		uri: Option<String>,
		reply: oneshot::Sender<Result<Endpoint, BusError>>,
	},
	ConnectionLost {
		generation: u64,
		reason: ShutdownReason,
	},
	Subscribe {
		subscription: Subscription,
		reply: oneshot::Sender<Result<(), BusError>>,
	},
	Unsubscribe {
		key: SubscriptionKey,
		reply: oneshot::Sender<()>,
	},
	Close {
		reply: oneshot::Sender<()>,
	},
}

/// The connection-owner task.
pub(crate) struct ConnectionManagerActor<S> {
	connector: Arc<dyn Connector>,
	config: ConnectionConfig,
	registry: Arc<SubscriptionRegistry>,
	publisher: Arc<MessagePublisher<S>>,
	dead_letter: Arc<dyn DeadLetterStrategy>,
	established_tx: broadcast::Sender<ConnectionEstablished>,
	command_tx: mpsc::Sender<Command>,
	command_rx: mpsc::Receiver<Command>,
	connection: Option<Arc<dyn Connection>>,
	// Stamps shutdown notifications so a dead connection's watcher can never
	// trigger a reconnect of its successor.
	generation: u64,
	closed: bool,
	watcher: Option<JoinHandle<()>>,
}

impl<S> ConnectionManagerActor<S>
where S: Clone + Send + Sync + 'static
{
	pub(crate) fn spawn(
		connector: Arc<dyn Connector>,
		config: ConnectionConfig,
		registry: Arc<SubscriptionRegistry>,
		publisher: Arc<MessagePublisher<S>>,
		dead_letter: Arc<dyn DeadLetterStrategy>,
		established_tx: broadcast::Sender<ConnectionEstablished>,
	) -> ConnectionManagerHandle {
		let (command_tx, command_rx) =
			mpsc::channel(COMMAND_CHANNEL_CAPACITY);
		let actor = Self {
			connector,
			config,
			registry,
			publisher,
			dead_letter,
			established_tx,
			command_tx: command_tx.clone(),
			command_rx,
			connection: None,
			generation: 0,
			closed: false,
			watcher: None,
		};
		tokio::spawn(async move { actor.run().await });
		ConnectionManagerHandle { command_tx }
	}

	async fn run(mut self) {
		while let Some(command) = self.command_rx.recv().await {
			match command {
				| Command::Connect { uri, reply } => {
					let result = self.handle_connect(uri).await;
					let _ = reply.send(result);
				}
				| Command::ConnectionLost { generation, reason } => {
					self.handle_connection_lost(generation, reason).await;
				}
				| Command::Subscribe { subscription, reply } => {
					let result = self.handle_subscribe(subscription).await;
					let _ = reply.send(result);
				}
				| Command::Unsubscribe { key, reply } => {
					self.registry.remove(&key).await;
					let _ = reply.send(());
				}
				| Command::Close { reply } => {
					self.handle_close().await;
					let _ = reply.send(());
					break;
				}
			}
		}
		debug!("connection manager exiting");
	}

	async fn handle_connect(
		&mut self,
		uri: Option<String>,
	) -> Result<Endpoint, BusError> {
		if self.closed {
			return Err(BusError::Closed);
		}
		if let Some(connection) = &self.connection {
			if connection.is_open() {
				debug!("connect called while connected, ignoring");
				return Ok(connection.endpoint());
			}
		}
		let uri = uri.unwrap_or_else(|| self.config.uri.clone());
		let connection = self.connector.connect(&uri).await?;
		self.config.uri = uri;
		let endpoint = self.install_connection(connection).await;
		// Subscriptions registered (or orphaned by a failed reconnect)
		// before this connect bind here, before queued traffic resumes.
		if let Some(connection) = self.connection.clone() {
			self.registry.renew_all(&connection).await;
		}
		self.publisher.flush().await;
		self.notify_established(&endpoint);
		info!(endpoint = %endpoint, "connected to broker");
		Ok(endpoint)
	}

	async fn handle_connection_lost(
		&mut self,
		generation: u64,
		reason: ShutdownReason,
	) {
		if self.closed {
			debug!("shutdown notification after close, ignoring");
			return;
		}
		if generation != self.generation {
			debug!(
				generation,
				current = self.generation,
				"stale shutdown notification, ignoring"
			);
			return;
		}
		warn!(reason = %reason, "broker connection lost unexpectedly");

		// Detach from the dead connection before touching anything else so
		// its notifications cannot re-enter this path.
		if let Some(watcher) = self.watcher.take() {
			watcher.abort();
		}
		self.connection = None;

		// One attempt after a fixed delay. The owner task stalls here on
		// purpose: no other lifecycle command runs mid-recovery.
		tokio::time::sleep(self.config.reconnect_delay).await;
		match self.connector.connect(&self.config.uri).await {
			| Ok(connection) => {
				let endpoint = self.install_connection(connection).await;
				if let Some(connection) = self.connection.clone() {
					self.registry.renew_all(&connection).await;
				}
				self.publisher.flush().await;
				self.notify_established(&endpoint);
				info!(endpoint = %endpoint, "reconnected to broker");
			}
			| Err(err) => {
				error!(
					error = %err,
					"reconnect attempt failed, bus left disconnected"
				);
			}
		}
	}

	/// Wires a freshly opened connection into the bus: event watcher,
	/// publisher, dead-letter strategy, reply listener. The previous handle
	/// is dropped only after the new one is in place.
	async fn install_connection(
		&mut self,
		connection: Arc<dyn Connection>,
	) -> Endpoint {
		self.generation += 1;
		let generation = self.generation;
		let mut events = connection.events();
		let command_tx = self.command_tx.clone();
		let watcher = tokio::spawn(async move {
			loop {
				match events.recv().await {
					| Ok(ConnectionEvent::Shutdown(reason)) => {
						let command =
							Command::ConnectionLost { generation, reason };
						if command_tx.send(command).await.is_err() {
							debug!(
								"connection manager gone, shutdown \
								 notification dropped"
							);
						}
						break;
					}
					| Ok(ConnectionEvent::CallbackException(detail)) => {
						// Logged only; must never take down the watcher.
						error!(
							detail = %detail,
							"transport callback raised an exception"
						);
					}
					| Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "connection event stream lagged");
					}
					| Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		if let Some(previous) = self.watcher.replace(watcher) {
			previous.abort();
		}

		self.publisher
			.set_connection(Arc::clone(&connection))
			.await;
		self.dead_letter
			.set_connection(Arc::clone(&connection))
			.await;
		if let Err(err) =
			self.publisher.bind_reply_listener(&connection).await
		{
			warn!(error = %err, "failed to start reply listener");
		}
		let endpoint = connection.endpoint();
		self.connection = Some(connection);
		endpoint
	}

	async fn handle_subscribe(
		&mut self,
		mut subscription: Subscription,
	) -> Result<(), BusError> {
		if self.closed {
			return Err(BusError::Closed);
		}
		if self.registry.contains(subscription.key()).await {
			return Err(crate::subscription::registry::DuplicateSubscription(
				subscription.key().clone(),
			)
			.into());
		}
		match self.connection.clone().filter(|c| c.is_open()) {
			| Some(connection) => {
				subscription.start(&connection).await?;
				debug!(key = %subscription.key(), "subscription started");
			}
			| None => {
				debug!(
					key = %subscription.key(),
					"no connection, subscription starts on connect"
				);
			}
		}
		// contains() above makes a duplicate here unreachable while this
		// task is the registry's only writer; keep the invariant anyway.
		self.registry.add(subscription).await?;
		Ok(())
	}

	async fn handle_close(&mut self) {
		if self.closed {
			debug!("close called twice, ignoring");
			return;
		}
		self.closed = true;
		if let Some(watcher) = self.watcher.take() {
			watcher.abort();
		}
		self.registry.drain().await;
		self.publisher.shutdown().await;
		if let Some(connection) = self.connection.take() {
			if connection.is_open() {
				if let Err(err) = connection.close().await {
					warn!(error = %err, "error closing broker connection");
				}
			}
			info!("disconnected from broker");
		}
	}

	fn notify_established(&self, endpoint: &Endpoint) {
		let event = ConnectionEstablished {
			endpoint: endpoint.clone(),
		};
		// No receivers is fine; the event is advisory.
		let _ = self.established_tx.send(event);
	}
}

/// Cheap handle for talking to the connection-owner task.
#[derive(Clone)]
pub struct ConnectionManagerHandle {
	command_tx: mpsc::Sender<Command>,
}

impl ConnectionManagerHandle {
	pub(crate) async fn connect(
		&self,
		uri: Option<String>,
	) -> Result<Endpoint, BusError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.command_tx
			.send(Command::Connect {
				uri,
				reply: reply_tx,
			})
			.await
			.map_err(|_| BusError::Closed)?;
		reply_rx.await.map_err(|_| BusError::Closed)?
	}

	pub(crate) async fn subscribe(
		&self,
		subscription: Subscription,
	) -> Result<(), BusError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.command_tx
			.send(Command::Subscribe {
				subscription,
				reply: reply_tx,
			})
			.await
			.map_err(|_| BusError::Closed)?;
		reply_rx.await.map_err(|_| BusError::Closed)?
	}

	pub(crate) async fn unsubscribe(&self, key: SubscriptionKey) {
		let (reply_tx, reply_rx) = oneshot::channel();
		let command = Command::Unsubscribe {
			key,
			reply: reply_tx,
		};
		// A closed bus has no subscriptions left to remove.
		if self.command_tx.send(command).await.is_err() {
			return;
		}
		let _ = reply_rx.await;
	}

	pub(crate) async fn close(&self) {
		let (reply_tx, reply_rx) = oneshot::channel();
		let command = Command::Close { reply: reply_tx };
		if self.command_tx.send(command).await.is_err() {
			debug!("close on already-closed bus, ignoring");
			return;
		}
		let _ = reply_rx.await;
	}
}
