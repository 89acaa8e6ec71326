// SPDX-License-Identifier: MIT OR Apache-2.0

//! MQTT client with automatic reconnection.

use crate::topics::Subscription;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twd_resilience::ExponentialBackoff;

/// An incoming bus message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Full topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Callback invoked for every received message.
pub type MessageHandler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked after the second and later successful connections.
pub type ReconnectHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection settings for the event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier.
    pub client_id: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Initial reconnect delay.
    pub base_reconnect_delay: Duration,
    /// Reconnect delay cap.
    pub max_reconnect_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "twinward-agent".into(),
            username: None,
            password: None,
            base_reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// Observable connection state, for readiness probes.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Whether the client is currently connected.
    pub connected: bool,
    /// Successful connections since start.
    pub connection_count: u64,
    /// Disconnections since start.
    pub disconnection_count: u64,
    /// Timestamp of the last successful connection.
    pub last_connected: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BusState {
    connected: AtomicBool,
    connection_count: AtomicU64,
    disconnection_count: AtomicU64,
}

/// Publish/subscribe client with a background reconnect loop.
///
/// Handlers and subscriptions must be registered before [`EventBusClient::start`];
/// late registrations take effect from the next (re)connection.
pub struct EventBusClient {
    config: BusConfig,
    subscriptions: Mutex<Vec<Subscription>>,
    handlers: Mutex<Vec<MessageHandler>>,
    reconnect_handlers: Mutex<Vec<ReconnectHandler>>,
    state: BusState,
    last_connected: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBusClient {
    /// Create a client; nothing connects until [`EventBusClient::start`].
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            subscriptions: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            reconnect_handlers: Mutex::new(Vec::new()),
            state: BusState::default(),
            last_connected: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Replace the subscription set.
    pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) {
        *self.lock(&self.subscriptions) = subscriptions;
    }

    /// Register a message handler.
    pub fn add_handler(&self, handler: MessageHandler) {
        self.lock(&self.handlers).push(handler);
    }

    /// Register a reconnect handler.
    ///
    /// Reconnect handlers fire after the second and later successful
    /// connections, never on the first, so a consumer can resync state that
    /// events may have skipped past while the link was down.
    pub fn add_reconnect_handler(&self, handler: ReconnectHandler) {
        self.lock(&self.reconnect_handlers).push(handler);
    }

    /// Whether the client is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    /// Connection statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connected: self.is_connected(),
            connection_count: self.state.connection_count.load(Ordering::Relaxed),
            disconnection_count: self.state.disconnection_count.load(Ordering::Relaxed),
            last_connected: *self.lock(&self.last_connected),
        }
    }

    /// Spawn the background connect/listen/reconnect loop.
    pub fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move { client.run_loop().await });
        *self.lock(&self.task) = Some(handle);
    }

    /// Stop the background loop promptly.
    pub fn shutdown(&self) {
        if let Some(handle) = self.lock(&self.task).take() {
            handle.abort();
        }
        self.state.connected.store(false, Ordering::Relaxed);
    }

    async fn run_loop(self: Arc<Self>) {
        let mut backoff = ExponentialBackoff::new(
            self.config.base_reconnect_delay,
            self.config.max_reconnect_delay,
        );
        loop {
            let err = self.connect_and_listen(&mut backoff).await;
            self.state.connected.store(false, Ordering::Relaxed);
            self.state
                .disconnection_count
                .fetch_add(1, Ordering::Relaxed);
            let delay = backoff.next_delay();
            warn!(
                error = %err,
                delay_secs = delay.as_secs_f64(),
                attempt = backoff.attempt_count(),
                "event bus connection lost, reconnecting with backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one connection until it fails; returns the terminating error.
    async fn connect_and_listen(
        &self,
        backoff: &mut ExponentialBackoff,
    ) -> rumqttc::ConnectionError {
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "connecting to event bus"
        );
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options(None), 64);
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.on_connected(&client, backoff).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(BusMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    })
                    .await;
                }
                Ok(_) => {}
                Err(err) => return err,
            }
        }
    }

    async fn on_connected(&self, client: &AsyncClient, backoff: &mut ExponentialBackoff) {
        self.state.connected.store(true, Ordering::Relaxed);
        let connection_number = self.state.connection_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.lock(&self.last_connected) = Some(Utc::now());
        backoff.reset();

        let subscriptions = self.lock(&self.subscriptions).clone();
        for sub in &subscriptions {
            if let Err(err) = client.subscribe(&sub.topic, qos_from(sub.qos)).await {
                error!(topic = %sub.topic, error = %err, "subscribe failed");
            } else {
                debug!(topic = %sub.topic, qos = sub.qos, "subscribed");
            }
        }
        info!(
            subscription_count = subscriptions.len(),
            connection_number, "event bus connected and subscribed"
        );

        if connection_number > 1 {
            let handlers = self.lock(&self.reconnect_handlers).clone();
            info!(handler_count = handlers.len(), "running reconnect handlers");
            for handler in handlers {
                handler().await;
            }
        }
    }

    async fn dispatch(&self, message: BusMessage) {
        let handlers = self.lock(&self.handlers).clone();
        for handler in handlers {
            handler(message.clone()).await;
        }
    }

    /// Publish a one-off message on a short-lived connection.
    ///
    /// # Errors
    ///
    /// Returns the client error when the broker rejects the publish or the
    /// connection cannot be established.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
    ) -> Result<(), rumqttc::ClientError> {
        let suffix = format!("{}-pub", self.config.client_id);
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options(Some(&suffix)), 16);
        client.publish(topic, qos_from(qos), false, payload).await?;
        client.disconnect().await?;
        // Drive the event loop until the disconnect goes out.
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        Ok(())
    }

    fn mqtt_options(&self, client_id_override: Option<&str>) -> MqttOptions {
        let id = client_id_override.unwrap_or(&self.config.client_id);
        let mut options = MqttOptions::new(id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}
