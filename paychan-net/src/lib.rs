//! Payment channels over TCP: a listener running one server machine per
//! accepted connection, a client connection, and the pieces the `paychand`
//! daemon is assembled from.

#![forbid(unsafe_code)]

pub mod broadcast;
pub mod client_connection;
#[cfg(feature = "main")]
pub mod config;
pub mod listener;
pub mod observability;
pub mod session;
pub mod store;

pub use client_connection::PaymentChannelClientConnection;
pub use listener::{
    HandlerFactory, ListenerConfig, PaymentChannelServerListener, ServerConnectionEventHandler,
};
pub use session::SessionHandle;
