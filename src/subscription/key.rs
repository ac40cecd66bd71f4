//! Subscription identity.

use std::fmt;

use arcstr::ArcStr;

use crate::transport::{ConsumeRoute, Headers};

/// Value identity of one subscription: message type, optional routing key and
/// optional headers. Two keys are equal iff all three components are equal;
/// headers are compared by content.
///
/// The registry never holds two subscriptions with an equal key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
	message_type: &'static str,
	routing_key: Option<ArcStr>,
	headers: Option<Headers>,
}

impl SubscriptionKey {
	/// Builds the key for message type `T` with the given route options.
	pub fn of<T>(
		routing_key: Option<ArcStr>,
		headers: Option<Headers>,
	) -> Self {
		Self {
			message_type: std::any::type_name::<T>(),
			routing_key,
			headers,
		}
	}

	/// Opaque identifier of the message type this key subscribes.
	pub fn message_type(&self) -> &'static str {
		self.message_type
	}

	/// The routing key component, if one was given.
	pub fn routing_key(&self) -> Option<&ArcStr> {
		self.routing_key.as_ref()
	}

	/// The headers component, if one was given.
	pub fn headers(&self) -> Option<&Headers> {
		self.headers.as_ref()
	}

	/// The consume route this key binds on. Falls back to a route derived
	/// from the message type name when no routing key was given.
	pub fn consume_route(&self) -> ConsumeRoute {
		ConsumeRoute {
			routing_key: self
				.routing_key
				.clone()
				.unwrap_or_else(|| {
					ArcStr::from(short_type_name(self.message_type))
				}),
			headers: self.headers.clone(),
		}
	}
}

impl fmt::Display for SubscriptionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", short_type_name(self.message_type))?;
		if let Some(routing_key) = &self.routing_key {
			write!(f, "[{routing_key}]")?;
		}
		if let Some(headers) = &self.headers {
			write!(f, "{{{} headers}}", headers.len())?;
		}
		Ok(())
	}
}

/// Strips module path segments from a fully qualified type name.
pub(crate) fn short_type_name(full: &str) -> &str {
	full.rsplit("::").next().unwrap_or(full)
}
