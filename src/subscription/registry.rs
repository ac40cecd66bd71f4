//! Single source of truth for active subscriptions.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{Subscription, SubscriptionKey};
use crate::transport::Connection;

/// `subscribe` was called twice with an equal key and no intervening
/// unsubscribe.
#[derive(Debug, thiserror::Error)]
#[error("subscription already registered for {0}")]
pub struct DuplicateSubscription(pub SubscriptionKey);

/// Insertion-ordered collection of active subscriptions, keyed by
/// [`SubscriptionKey`]. Renewal walks entries in the order they were added.
pub struct SubscriptionRegistry {
	entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(Vec::new()),
		}
	}

	/// Adds a subscription, failing fast if its key is already present.
	pub async fn add(
		&self,
		subscription: Subscription,
	) -> Result<(), DuplicateSubscription> {
		let mut entries = self.entries.lock().await;
		if entries.iter().any(|s| s.key() == subscription.key()) {
			return Err(DuplicateSubscription(subscription.key().clone()));
		}
		entries.push(subscription);
		Ok(())
	}

	/// Whether a subscription with `key` is registered.
	pub async fn contains(&self, key: &SubscriptionKey) -> bool {
		self.entries
			.lock()
			.await
			.iter()
			.any(|s| s.key() == key)
	}

	/// Stops and removes the subscription with `key`. No-op if absent.
	pub async fn remove(&self, key: &SubscriptionKey) {
		let mut entries = self.entries.lock().await;
		match entries.iter().position(|s| s.key() == key) {
			| Some(index) => {
				let mut subscription = entries.remove(index);
				subscription.stop();
				debug!(key = %key, "subscription removed");
			}
			| None => {
				debug!(key = %key, "unsubscribe for unknown key, ignoring");
			}
		}
	}

	/// Rebinds every subscription's consumer against `connection`, in
	/// insertion order. Renewal is best-effort: a failing entry is logged and
	/// left in place, and the remaining entries are still attempted.
	pub async fn renew_all(&self, connection: &Arc<dyn Connection>) {
		let mut entries = self.entries.lock().await;
		if entries.is_empty() {
			debug!("no subscriptions to renew");
			return;
		}
		let total = entries.len();
		let mut renewed = 0usize;
		for subscription in entries.iter_mut() {
			match subscription.renew(connection).await {
				| Ok(()) => renewed += 1,
				| Err(err) => {
					error!(
						key = %subscription.key(),
						error = %err,
						"failed to renew subscription"
					);
				}
			}
		}
		info!(renewed, total, "subscriptions have been renewed");
	}

	/// Stops every subscription and clears the registry.
	pub async fn drain(&self) {
		let mut entries = self.entries.lock().await;
		for subscription in entries.iter_mut() {
			subscription.stop();
		}
		entries.clear();
	}

	/// Number of registered subscriptions.
	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	/// Whether the registry holds no subscriptions.
	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.is_empty()
	}
}

impl Default for SubscriptionRegistry {
	fn default() -> Self {
		Self::new()
	}
}
