//! Long-lived stream subscriptions.

pub mod connector;
pub mod reconnector;

pub use connector::{StreamConnector, StreamEvent, WebSocketConnector};
pub use reconnector::{Handlers, StreamPayload, StreamReconnector, SubscriptionId};
