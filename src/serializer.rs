//! Message body serialization strategies.

use std::fmt::Debug;

use bincode::{Decode, Encode};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Converts typed messages to and from wire bytes.
///
/// Implement this trait to plug in a custom format; the bus is generic over
/// the strategy and uses one instance for every message type it touches.
pub trait SerializationStrategy<T>:
	Default + Clone + Send + Sync + 'static
{
	/// Error type for serialization failures
	type SerializeError: Debug + Send + Sync + 'static;
	/// Error type for deserialization failures
	type DeserializeError: Debug + Send + Sync + 'static;

	/// Convert a message to bytes for transmission
	fn serialize(&self, message: &T) -> Result<Vec<u8>, Self::SerializeError>;
	/// Convert received bytes back into a typed message
	fn deserialize(&self, bytes: &[u8])
	-> Result<T, Self::DeserializeError>;
}

/// Default strategy: JSON via `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl<T> SerializationStrategy<T> for JsonSerializer
where T: Serialize + DeserializeOwned + 'static
{
	type DeserializeError = serde_json::Error;
	type SerializeError = serde_json::Error;

	fn serialize(&self, message: &T) -> Result<Vec<u8>, Self::SerializeError> {
		serde_json::to_vec(message)
	}

	fn deserialize(
		&self,
		bytes: &[u8],
	) -> Result<T, Self::DeserializeError> {
		serde_json::from_slice(bytes)
	}
}

/// Compact binary strategy using bincode.
///
/// Requires message types to implement `bincode::Encode` and
/// `bincode::Decode`.
#[derive(Clone, Default)]
pub struct BincodeSerializer {
	config: bincode::config::Configuration,
}

impl BincodeSerializer {
	/// Creates a serializer with the default bincode configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a serializer with a custom bincode configuration.
	pub fn with_config(config: bincode::config::Configuration) -> Self {
		Self { config }
	}
}

impl<T> SerializationStrategy<T> for BincodeSerializer
where T: Encode + Decode<()> + 'static
{
	type DeserializeError = bincode::error::DecodeError;
	type SerializeError = bincode::error::EncodeError;

	fn serialize(&self, message: &T) -> Result<Vec<u8>, Self::SerializeError> {
		bincode::encode_to_vec(message, self.config)
	}

	fn deserialize(
		&self,
		bytes: &[u8],
	) -> Result<T, Self::DeserializeError> {
		bincode::decode_from_slice(bytes, self.config)
			.map(|(value, _)| value)
	}
}
