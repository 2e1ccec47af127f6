//! Pooled stream subscriptions with exponential-backoff reconnect.
//!
//! Subscriptions are owned records keyed by [`SubscriptionId`]. Each pooled
//! connection has one dispatch task that fans events out to the
//! subscriptions currently attached to it. An unintentional close schedules
//! a reconnect per subscription; intentional teardown cancels the
//! connection's token first, so its dispatcher never reconnects.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::{StreamConnector, StreamEvent};
use crate::config::StreamConfig;
use crate::AppError;

/// Message callback.
pub type MessageHandler = Arc<dyn Fn(StreamPayload) + Send + Sync>;
/// Error callback.
pub type ErrorHandler = Arc<dyn Fn(AppError) + Send + Sync>;

/// Opaque subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    /// The payload parsed as JSON.
    Json(Value),
    /// The payload as received, when it is not JSON.
    Raw(String),
}

impl StreamPayload {
    fn parse(text: String) -> Self {
        serde_json::from_str(&text).map_or(Self::Raw(text), Self::Json)
    }
}

/// Callbacks attached to one subscription.
#[derive(Clone)]
pub struct Handlers {
    on_message: MessageHandler,
    on_error: Option<ErrorHandler>,
}

impl Handlers {
    /// Handlers delivering messages to `on_message`.
    pub fn new(on_message: impl Fn(StreamPayload) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_error: None,
        }
    }

    /// Also deliver transport errors and reconnect exhaustion to `on_error`.
    #[must_use]
    pub fn on_error(mut self, on_error: impl Fn(AppError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

struct Subscription {
    url: String,
    connection: u64,
    handlers: Handlers,
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
    closed: bool,
}

struct PooledConnection {
    id: u64,
    cancel: CancellationToken,
    open: bool,
}

#[derive(Default)]
struct State {
    next_subscription: u64,
    next_connection: u64,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    pool: HashMap<String, PooledConnection>,
}

struct Shared {
    base_delay: Duration,
    default_max_attempts: u32,
    connector: Arc<dyn StreamConnector>,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Subscription manager over pooled connections.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct StreamReconnector {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamReconnector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("StreamReconnector")
            .field("base_delay", &self.shared.base_delay)
            .field("subscriptions", &state.subscriptions.len())
            .field("pooled", &state.pool.len())
            .finish()
    }
}

impl StreamReconnector {
    /// Reconnector over `connector` using the backoff settings in `config`.
    pub fn new(config: &StreamConfig, connector: impl StreamConnector) -> Self {
        Self {
            shared: Arc::new(Shared {
                base_delay: Duration::from_millis(config.base_reconnect_delay_ms),
                default_max_attempts: config.max_reconnect_attempts,
                connector: Arc::new(connector),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Subscribe to `url` with the configured attempt limit.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, url: impl Into<String>, handlers: Handlers) -> SubscriptionId {
        let max_attempts = self.shared.default_max_attempts;
        self.subscribe_with_attempts(url, handlers, max_attempts)
    }

    /// Subscribe to `url`, giving up after `max_attempts` failed reconnects.
    ///
    /// An open or opening pooled connection for `url` is shared; otherwise a
    /// new one is opened and pooled.
    pub fn subscribe_with_attempts(
        &self,
        url: impl Into<String>,
        handlers: Handlers,
        max_attempts: u32,
    ) -> SubscriptionId {
        let url = url.into();
        let mut state = self.shared.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        let connection = attach(&self.shared, &mut state, &url);
        state.subscriptions.insert(
            id,
            Subscription {
                url: url.clone(),
                connection,
                handlers,
                attempts: 0,
                max_attempts,
                delay: self.shared.base_delay,
                closed: false,
            },
        );
        info!(subscription = %id, url = %url, "stream subscribed");
        id
    }

    /// Remove a subscription; closes its connection when nobody else uses it.
    ///
    /// Returns `false` for an unknown or already removed id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.shared.lock();
        let Some(mut subscription) = state.subscriptions.remove(&id) else {
            return false;
        };
        subscription.closed = true;

        let still_used = state
            .subscriptions
            .values()
            .any(|other| !other.closed && other.url == subscription.url);
        if !still_used {
            if let Some(connection) = state.pool.remove(&subscription.url) {
                connection.cancel.cancel();
                debug!(url = %subscription.url, "pooled connection closed");
            }
        }
        info!(subscription = %id, "stream unsubscribed");
        true
    }

    /// Tear down every subscription and pooled connection.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        for subscription in state.subscriptions.values_mut() {
            subscription.closed = true;
        }
        state.subscriptions.clear();
        for (_, connection) in state.pool.drain() {
            connection.cancel.cancel();
        }
        info!("stream reconnector closed");
    }

    /// Number of pooled connections.
    #[must_use]
    pub fn pooled_connections(&self) -> usize {
        self.shared.lock().pool.len()
    }

    /// Whether a connection for `url` is pooled.
    #[must_use]
    pub fn is_pooled(&self, url: &str) -> bool {
        self.shared.lock().pool.contains_key(url)
    }

    /// Whether the pooled connection for `url` has reported `Opened`.
    #[must_use]
    pub fn is_open(&self, url: &str) -> bool {
        self.shared.lock().pool.get(url).is_some_and(|conn| conn.open)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.len()
    }
}

/// Join the pooled connection for `url`, opening one if none exists.
fn attach(shared: &Arc<Shared>, state: &mut State, url: &str) -> u64 {
    if let Some(existing) = state.pool.get(url) {
        return existing.id;
    }
    state.next_connection += 1;
    let id = state.next_connection;
    let cancel = CancellationToken::new();
    let events = shared.connector.connect(url, cancel.clone());
    state.pool.insert(
        url.to_owned(),
        PooledConnection {
            id,
            cancel: cancel.clone(),
            open: false,
        },
    );
    tokio::spawn(dispatch(Arc::clone(shared), url.to_owned(), id, cancel, events));
    id
}

async fn dispatch(
    shared: Arc<Shared>,
    url: String,
    connection: u64,
    cancel: CancellationToken,
    mut events: mpsc::Receiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        if cancel.is_cancelled() {
            return;
        }
        match event {
            StreamEvent::Opened => {
                let mut state = shared.lock();
                if let Some(pooled) = state.pool.get_mut(&url).filter(|p| p.id == connection) {
                    pooled.open = true;
                }
                for subscription in state.subscriptions.values_mut() {
                    if subscription.connection == connection && !subscription.closed {
                        subscription.attempts = 0;
                        subscription.delay = shared.base_delay;
                    }
                }
                debug!(url = %url, connection, "stream opened");
            }
            StreamEvent::Message(text) => {
                let receivers: Vec<MessageHandler> = attached(&shared, connection)
                    .into_iter()
                    .map(|handlers| handlers.on_message)
                    .collect();
                let payload = StreamPayload::parse(text);
                for on_message in receivers {
                    on_message(payload.clone());
                }
            }
            StreamEvent::Error(message) => {
                warn!(url = %url, error = %message, "stream error");
                for handlers in attached(&shared, connection) {
                    if let Some(on_error) = handlers.on_error {
                        on_error(AppError::Stream(message.clone()));
                    }
                }
            }
            StreamEvent::Closed => break,
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    connection_lost(&shared, &url, connection);
}

fn attached(shared: &Shared, connection: u64) -> Vec<Handlers> {
    shared
        .lock()
        .subscriptions
        .values()
        .filter(|sub| sub.connection == connection && !sub.closed)
        .map(|sub| sub.handlers.clone())
        .collect()
}

fn connection_lost(shared: &Arc<Shared>, url: &str, connection: u64) {
    let mut exhausted = Vec::new();
    {
        let mut state = shared.lock();
        if state.pool.get(url).is_some_and(|p| p.id == connection) {
            state.pool.remove(url);
        }

        let mut finished = Vec::new();
        for (id, subscription) in &mut state.subscriptions {
            if subscription.connection != connection || subscription.closed {
                continue;
            }
            if subscription.attempts < subscription.max_attempts {
                subscription.attempts += 1;
                let factor = 2u32.saturating_pow(subscription.attempts - 1);
                subscription.delay = shared.base_delay.saturating_mul(factor);
                info!(
                    subscription = %id,
                    attempt = subscription.attempts,
                    delay_ms = u64::try_from(subscription.delay.as_millis()).unwrap_or(u64::MAX),
                    "stream reconnect scheduled"
                );
                schedule_reconnect(Arc::clone(shared), *id, subscription.delay);
            } else {
                subscription.closed = true;
                finished.push(*id);
                warn!(subscription = %id, attempts = subscription.attempts, "stream reconnect exhausted");
                exhausted.push((subscription.attempts, subscription.handlers.on_error.clone()));
            }
        }
        for id in finished {
            state.subscriptions.remove(&id);
        }
    }

    for (attempts, on_error) in exhausted {
        if let Some(on_error) = on_error {
            on_error(AppError::Stream(format!(
                "failed to reconnect after {attempts} attempts"
            )));
        }
    }
}

fn schedule_reconnect(shared: Arc<Shared>, id: SubscriptionId, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = shared.lock();
        let Some(url) = state
            .subscriptions
            .get(&id)
            .filter(|sub| !sub.closed)
            .map(|sub| sub.url.clone())
        else {
            return;
        };
        let connection = attach(&shared, &mut state, &url);
        let already_open = state.pool.get(&url).is_some_and(|p| p.open);
        if let Some(subscription) = state.subscriptions.get_mut(&id) {
            subscription.connection = connection;
            if already_open {
                subscription.attempts = 0;
                subscription.delay = shared.base_delay;
            }
        }
        debug!(subscription = %id, connection, "stream reconnecting");
    });
}
