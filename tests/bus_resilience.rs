//! End-to-end recovery scenarios against the in-memory transport:
//! connection loss, renewal, offline queueing, request/reply and
//! dead-lettering.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing_subscriber::layer::SubscriberExt;
use typed_bus::ErrorCallback;
use typed_bus::advanced::{Connection, Connector, ConsumeRoute, Publication};
use typed_bus::prelude::*;
use typed_bus::transport::memory::MemoryBroker;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OrderPlaced {
	id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Ping {
	seq: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Pong {
	seq: u32,
}

fn test_config() -> BusConfig<JsonSerializer> {
	BusConfig::new("memory://localhost:5672")
		.with_reconnect_delay(Duration::from_millis(10))
}

/// Counts log events announcing a completed subscription renewal.
struct RenewalCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RenewalCounter {
	fn on_event(
		&self,
		event: &tracing::Event<'_>,
		_ctx: tracing_subscriber::layer::Context<'_, S>,
	) {
		struct MessageVisitor(bool);
		impl tracing::field::Visit for MessageVisitor {
			fn record_debug(
				&mut self,
				field: &tracing::field::Field,
				value: &dyn std::fmt::Debug,
			) {
				if field.name() == "message"
					&& format!("{value:?}")
						.contains("subscriptions have been renewed")
				{
					self.0 = true;
				}
			}
		}
		let mut visitor = MessageVisitor(false);
		event.record(&mut visitor);
		if visitor.0 {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}
}

fn renewal_counter() -> (tracing::subscriber::DefaultGuard, Arc<AtomicUsize>)
{
	let count = Arc::new(AtomicUsize::new(0));
	let subscriber = tracing_subscriber::registry()
		.with(RenewalCounter(Arc::clone(&count)));
	(tracing::subscriber::set_default(subscriber), count)
}

fn collecting_bus(
	config: BusConfig<JsonSerializer>,
) -> (
	MessageBus<JsonSerializer>,
	MemoryBroker,
	Arc<Mutex<Vec<OrderPlaced>>>,
) {
	let (bus, broker) = MessageBus::in_memory(config);
	let received = Arc::new(Mutex::new(Vec::new()));
	(bus, broker, received)
}

async fn subscribe_collector(
	bus: &MessageBus<JsonSerializer>,
	received: &Arc<Mutex<Vec<OrderPlaced>>>,
) {
	let sink = Arc::clone(received);
	bus.subscribe_fn(
		move |order: OrderPlaced| {
			let sink = Arc::clone(&sink);
			async move {
				sink.lock().await.push(order);
				Ok(())
			}
		},
		Some("orders.new"),
		None,
	)
	.await
	.expect("subscribe failed");
}

async fn wait_for_received(
	received: &Arc<Mutex<Vec<OrderPlaced>>>,
	expected: usize,
) {
	for _ in 0..200 {
		if received.lock().await.len() >= expected {
			return;
		}
		sleep(Duration::from_millis(5)).await;
	}
	panic!(
		"expected {expected} messages, got {}",
		received.lock().await.len()
	);
}

#[tokio::test]
async fn subscription_survives_connection_loss() {
	let (_guard, renewals) = renewal_counter();
	let (bus, broker, received) = collecting_bus(test_config());
	bus.connect().await.expect("connect failed");
	subscribe_collector(&bus, &received).await;

	bus.publish(&OrderPlaced { id: 1 }, Some("orders.new"), None)
		.await
		.unwrap();
	wait_for_received(&received, 1).await;

	let mut established = bus.established();
	broker.drop_latest_connection("broker restart").await;
	timeout(Duration::from_secs(2), established.recv())
		.await
		.expect("reconnect timed out")
		.expect("established channel closed");

	// Same registration, bound to the new connection.
	assert_eq!(bus.active_subscriptions().await, 1);
	assert_eq!(broker.open_connections().await, 1);
	assert_eq!(broker.total_connections().await, 2);

	bus.publish(&OrderPlaced { id: 2 }, Some("orders.new"), None)
		.await
		.unwrap();
	wait_for_received(&received, 2).await;
	assert_eq!(
		*received.lock().await,
		vec![OrderPlaced { id: 1 }, OrderPlaced { id: 2 }]
	);
	assert_eq!(renewals.load(Ordering::SeqCst), 1);

	bus.close().await;
}

#[tokio::test]
async fn publications_queue_until_a_connection_exists() {
	let (bus, broker) = MessageBus::<JsonSerializer>::in_memory(test_config());

	for seq in 0..3 {
		bus.publish(&Ping { seq }, None, None).await.unwrap();
	}
	assert_eq!(bus.pending_publications().await, 3);
	assert!(broker.published().await.is_empty());
	assert_eq!(broker.total_connections().await, 0);

	bus.connect().await.unwrap();

	assert_eq!(bus.pending_publications().await, 0);
	let bodies: Vec<Ping> = broker
		.published()
		.await
		.iter()
		.map(|p| serde_json::from_slice(&p.payload).unwrap())
		.collect();
	assert_eq!(
		bodies,
		vec![Ping { seq: 0 }, Ping { seq: 1 }, Ping { seq: 2 }]
	);

	bus.close().await;
}

#[tokio::test]
async fn double_close_is_idempotent() {
	let (bus, _broker) =
		MessageBus::<JsonSerializer>::in_memory(test_config());
	bus.connect().await.unwrap();

	bus.close().await;
	bus.close().await;

	// Closing is permanent: no further connects.
	let err = bus.connect().await.unwrap_err();
	assert!(matches!(err, BusError::Closed));
}

#[tokio::test]
async fn failed_reconnect_is_swallowed_and_explicit_connect_recovers() {
	let (bus, broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	broker.fail_next_connects(1);
	broker.drop_latest_connection("network failure").await;
	sleep(Duration::from_millis(100)).await;

	// The single attempt failed; the bus stays disconnected.
	assert_eq!(broker.open_connections().await, 0);
	bus.publish(&OrderPlaced { id: 5 }, Some("orders.new"), None)
		.await
		.unwrap();
	assert_eq!(bus.pending_publications().await, 1);

	// A later explicit connect succeeds cleanly: the subscription is
	// renewed before the queued publication goes out.
	bus.connect().await.unwrap();
	wait_for_received(&received, 1).await;
	assert_eq!(broker.open_connections().await, 1);
	assert_eq!(bus.active_subscriptions().await, 1);

	bus.close().await;
}

#[tokio::test]
async fn duplicate_subscription_fails_fast() {
	let (bus, _broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	let err = bus
		.subscribe_fn(
			|_order: OrderPlaced| async move { Ok(()) },
			Some("orders.new"),
			None,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, BusError::DuplicateSubscription(_)));

	// Different header content makes a different key.
	let mut headers = typed_bus::advanced::Headers::new();
	headers.insert("region".to_string(), "eu".to_string());
	bus.subscribe_fn(
		|_order: OrderPlaced| async move { Ok(()) },
		Some("orders.new"),
		Some(headers),
	)
	.await
	.unwrap();
	assert_eq!(bus.active_subscriptions().await, 2);

	bus.close().await;
}

#[tokio::test]
async fn unsubscribe_releases_the_key() {
	let (bus, _broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	bus.unsubscribe::<OrderPlaced>(Some("orders.new"), None).await;
	assert_eq!(bus.active_subscriptions().await, 0);

	// The key is free again.
	subscribe_collector(&bus, &received).await;
	assert_eq!(bus.active_subscriptions().await, 1);

	bus.close().await;
}

#[tokio::test]
async fn reply_callback_fires_at_most_once() {
	let (bus, broker) = MessageBus::<JsonSerializer>::in_memory(test_config());
	bus.connect().await.unwrap();

	let responder = broker
		.connector()
		.connect("memory://localhost:5672")
		.await
		.unwrap();
	let mut requests = responder
		.consume(ConsumeRoute {
			routing_key: "Ping".into(),
			headers: None,
		})
		.await
		.unwrap();

	let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel(4);
	bus.publish_request::<Ping, Pong, _>(&Ping { seq: 1 }, move |ctx| {
		let _ = reply_tx.try_send(ctx.message);
	})
	.await
	.unwrap();

	let request = timeout(Duration::from_secs(1), requests.recv())
		.await
		.expect("request timed out")
		.expect("request channel closed");
	let reply_to = request.reply_to.clone().expect("reply_to missing");
	assert!(request.correlation_id.is_some());

	let mut reply = Publication::new(
		reply_to,
		Bytes::from(serde_json::to_vec(&Pong { seq: 1 }).unwrap()),
	);
	reply.correlation_id = request.correlation_id.clone();
	responder.publish(reply.clone()).await.unwrap();
	// A duplicate reply must not fire the callback again.
	responder.publish(reply).await.unwrap();

	let first = timeout(Duration::from_secs(1), reply_rx.recv())
		.await
		.expect("reply timed out")
		.expect("reply channel closed");
	assert_eq!(first, Pong { seq: 1 });

	sleep(Duration::from_millis(50)).await;
	assert!(reply_rx.try_recv().is_err());

	bus.close().await;
}

#[tokio::test]
async fn failed_handler_rejects_and_dead_letters() {
	let (bus, broker) = MessageBus::<JsonSerializer>::in_memory(test_config());
	bus.connect().await.unwrap();

	bus.subscribe_fn(
		|_order: OrderPlaced| async move {
			Err(ConsumeError::from("inventory lookup failed"))
		},
		Some("orders.new"),
		None,
	)
	.await
	.unwrap();

	bus.publish(&OrderPlaced { id: 9 }, Some("orders.new"), None)
		.await
		.unwrap();

	for _ in 0..200 {
		if !broker.rejections().await.is_empty() {
			break;
		}
		sleep(Duration::from_millis(5)).await;
	}
	let rejections = broker.rejections().await;
	assert_eq!(rejections.len(), 1);
	assert!(!rejections[0].1, "delivery must not be requeued");

	let published = broker.published().await;
	let dead = published
		.iter()
		.find(|p| p.routing_key.as_str() == "dead-letter")
		.expect("no dead-letter publication");
	let headers = dead.headers.as_ref().expect("dead-letter headers missing");
	assert_eq!(
		headers.get("x-death-reason").map(String::as_str),
		Some("inventory lookup failed")
	);
	assert_eq!(
		headers.get("x-original-routing-key").map(String::as_str),
		Some("orders.new")
	);

	bus.close().await;
}

#[tokio::test]
async fn error_callback_replaces_dead_lettering() {
	let (bus, broker) = MessageBus::<JsonSerializer>::in_memory(test_config());
	bus.connect().await.unwrap();

	let seen: Arc<std::sync::Mutex<Vec<(String, String)>>> =
		Arc::new(std::sync::Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);
	let on_error: ErrorCallback = Arc::new(move |key, err| {
		sink.lock().unwrap().push((key.to_string(), err.to_string()));
	});
	bus.subscribe_with::<OrderPlaced, _>(
		FnHandler(|_order: OrderPlaced| async move {
			Err(ConsumeError::from("inventory lookup failed"))
		}),
		Some("orders.new"),
		None,
		on_error,
	)
	.await
	.unwrap();

	bus.publish(&OrderPlaced { id: 4 }, Some("orders.new"), None)
		.await
		.unwrap();

	for _ in 0..200 {
		if !broker.rejections().await.is_empty() {
			break;
		}
		sleep(Duration::from_millis(5)).await;
	}
	let rejections = broker.rejections().await;
	assert_eq!(rejections.len(), 1);
	assert!(!rejections[0].1, "delivery must not be requeued");

	// The callback fired instead of the dead-letter strategy.
	assert_eq!(
		*seen.lock().unwrap(),
		vec![(
			"OrderPlaced[orders.new]".to_string(),
			"inventory lookup failed".to_string(),
		)]
	);
	assert!(
		broker
			.published()
			.await
			.iter()
			.all(|p| p.routing_key.as_str() != "dead-letter")
	);

	bus.close().await;
}

#[tokio::test]
async fn publish_after_close_fails() {
	let (bus, _broker) =
		MessageBus::<JsonSerializer>::in_memory(test_config());
	bus.connect().await.unwrap();
	bus.close().await;

	let err = bus
		.publish(&OrderPlaced { id: 1 }, Some("orders.new"), None)
		.await
		.unwrap_err();
	assert!(matches!(err, BusError::Closed));
	assert_eq!(bus.pending_publications().await, 0);
}

#[tokio::test]
async fn auto_registered_handlers_bootstrap_and_renew() {
	let received: Arc<Mutex<Vec<OrderPlaced>>> =
		Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&received);
	let config = test_config().register_handler::<OrderPlaced, _>(
		FnHandler(move |order: OrderPlaced| {
			let sink = Arc::clone(&sink);
			async move {
				sink.lock().await.push(order);
				Ok(())
			}
		}),
		Some("orders.new"),
		None,
	);

	let (bus, broker) = MessageBus::in_memory(config);
	bus.connect().await.unwrap();
	assert_eq!(bus.active_subscriptions().await, 1);

	bus.publish(&OrderPlaced { id: 1 }, Some("orders.new"), None)
		.await
		.unwrap();
	wait_for_received(&received, 1).await;

	// Table entries go through the same renewal path as explicit ones.
	let mut established = bus.established();
	broker.drop_latest_connection("broker restart").await;
	timeout(Duration::from_secs(2), established.recv())
		.await
		.expect("reconnect timed out")
		.expect("established channel closed");

	bus.publish(&OrderPlaced { id: 2 }, Some("orders.new"), None)
		.await
		.unwrap();
	wait_for_received(&received, 2).await;

	bus.close().await;
}

#[tokio::test]
async fn established_event_reaches_receivers_attached_before_connect() {
	let (bus, _broker) =
		MessageBus::<JsonSerializer>::in_memory(test_config());
	let mut established = bus.established();

	bus.connect().await.unwrap();

	let event = timeout(Duration::from_secs(1), established.recv())
		.await
		.expect("event timed out")
		.expect("established channel closed");
	assert_eq!(event.endpoint.host, "localhost");
	assert_eq!(event.endpoint.port, 5672);

	bus.close().await;
}

#[tokio::test]
async fn close_stops_subscriptions_and_rejects_new_ones() {
	let (bus, _broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	bus.close().await;
	assert_eq!(bus.active_subscriptions().await, 0);

	let err = bus
		.subscribe_fn(
			|_order: OrderPlaced| async move { Ok(()) },
			Some("orders.new"),
			None,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, BusError::Closed));
}

#[tokio::test]
async fn callback_exceptions_do_not_disturb_the_connection() {
	let (bus, broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	broker.raise_callback_exception("listener blew up").await;
	sleep(Duration::from_millis(50)).await;

	// Logged only: the connection and its subscriptions stay intact.
	assert_eq!(broker.open_connections().await, 1);
	bus.publish(&OrderPlaced { id: 3 }, Some("orders.new"), None)
		.await
		.unwrap();
	wait_for_received(&received, 1).await;

	bus.close().await;
}

#[tokio::test]
async fn stale_shutdown_notifications_are_ignored() {
	let (bus, broker, received) = collecting_bus(test_config());
	bus.connect().await.unwrap();
	subscribe_collector(&bus, &received).await;

	let mut established = bus.established();
	broker.drop_latest_connection("first restart").await;
	timeout(Duration::from_secs(2), established.recv())
		.await
		.expect("reconnect timed out")
		.expect("established channel closed");
	assert_eq!(broker.total_connections().await, 2);

	// Give any straggling notification a chance to be (wrongly) acted on.
	sleep(Duration::from_millis(100)).await;
	assert_eq!(broker.total_connections().await, 2);
	assert_eq!(broker.open_connections().await, 1);

	bus.close().await;
}
