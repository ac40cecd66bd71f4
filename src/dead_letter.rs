//! Disposal of messages a handler could not process.

use std::sync::Arc;

use arcstr::ArcStr;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::subscription::ConsumeError;
use crate::transport::{Connection, Delivery, Headers, Publication};

/// Policy for messages rejected without requeue.
///
/// Rebound to the current connection by the connection manager, the same way
/// the publisher is.
#[async_trait]
pub trait DeadLetterStrategy: Send + Sync + 'static {
	/// Swaps the connection used for dead-letter traffic.
	async fn set_connection(&self, connection: Arc<dyn Connection>);

	/// Disposes of one failed delivery. Must not fail; disposal problems are
	/// logged and swallowed.
	async fn dead_letter(&self, delivery: &Delivery, error: &ConsumeError);
}

/// Republishes failed deliveries to a dead-letter route, annotated with the
/// failure detail. Falls back to logging the drop while disconnected.
pub struct RepublishDeadLetterStrategy {
	routing_key: ArcStr,
	connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl RepublishDeadLetterStrategy {
	/// Creates a strategy publishing to `routing_key`.
	pub fn new(routing_key: ArcStr) -> Self {
		Self {
			routing_key,
			connection: Mutex::new(None),
		}
	}
}

#[async_trait]
impl DeadLetterStrategy for RepublishDeadLetterStrategy {
	async fn set_connection(&self, connection: Arc<dyn Connection>) {
		*self.connection.lock().await = Some(connection);
	}

	async fn dead_letter(&self, delivery: &Delivery, error: &ConsumeError) {
		let connection = self.connection.lock().await.clone();
		let connection = match connection {
			| Some(c) if c.is_open() => c,
			| _ => {
				warn!(
					routing_key = %delivery.routing_key,
					error = %error,
					"no connection for dead-lettering, message dropped"
				);
				return;
			}
		};

		let mut headers = delivery.headers.clone().unwrap_or_else(Headers::new);
		headers.insert(
			"x-death-reason".to_string(),
			error.to_string(),
		);
		headers.insert(
			"x-original-routing-key".to_string(),
			delivery.routing_key.to_string(),
		);

		let publication = Publication {
			routing_key: self.routing_key.clone(),
			headers: Some(headers),
			payload: delivery.payload.clone(),
			correlation_id: delivery.correlation_id.clone(),
			reply_to: None,
		};
		match connection.publish(publication).await {
			| Ok(()) => {
				debug!(
					routing_key = %delivery.routing_key,
					dead_letter_route = %self.routing_key,
					"delivery dead-lettered"
				);
			}
			| Err(err) => {
				warn!(
					routing_key = %delivery.routing_key,
					error = %err,
					"failed to dead-letter delivery, message dropped"
				);
			}
		}
	}
}

/// Logs and drops failed deliveries. Useful in tests and for callers that
/// treat rejection as a permanent drop.
pub struct DiscardDeadLetterStrategy;

#[async_trait]
impl DeadLetterStrategy for DiscardDeadLetterStrategy {
	async fn set_connection(&self, _connection: Arc<dyn Connection>) {}

	async fn dead_letter(&self, delivery: &Delivery, error: &ConsumeError) {
		warn!(
			routing_key = %delivery.routing_key,
			error = %error,
			"delivery discarded"
		);
	}
}
