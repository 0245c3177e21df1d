//! The connection subsystem: lifecycle, message pump, reply correlation,
//! signal routing and name tracking.

pub use self::builder::ConnectionBuilder;
mod builder;

pub use self::connection::{Connection, ConnectionState};
mod connection;

mod pump;

pub use self::signals::{OwnerChange, ServiceOwnerObserver, SignalHandler, SubscriptionHandle};
mod signals;

pub use self::names::NameRequest;
mod names;

pub use self::registry::{MethodHandler, MethodReply};
mod registry;

pub use self::proxy::Proxy;
mod proxy;

/// A user supplied executor for handler and callback invocations.
///
/// When configured on a [`ConnectionBuilder`], signal handlers, name
/// callbacks and state change watchers are marshaled onto it instead of
/// running inline on the connection's receive task. Implementations that
/// care about callback ordering should run submitted tasks in order.
pub trait CallbackExecutor: Send + Sync {
    /// Run a callback.
    fn spawn(&self, task: Box<dyn FnOnce() + Send>);
}
