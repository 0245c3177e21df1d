use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::connection::{BusTarget, Config, Connection};
use super::CallbackExecutor;

/// Builder of a [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use minibus::ConnectionBuilder;
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> minibus::Result<()> {
/// let c = ConnectionBuilder::new()
///     .auto_connect(true)
///     .call_timeout(Duration::from_secs(25))
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
pub struct ConnectionBuilder {
    bus: BusTarget,
    auto_connect: bool,
    call_timeout: Option<Duration>,
    executor: Option<Arc<dyn CallbackExecutor>>,
}

impl ConnectionBuilder {
    /// Construct a new builder targeting the session bus.
    pub fn new() -> Self {
        Self {
            bus: BusTarget::Session,
            auto_connect: false,
            call_timeout: None,
            executor: None,
        }
    }

    /// Target the session bus (the default).
    pub fn session_bus(&mut self) -> &mut Self {
        self.bus = BusTarget::Session;
        self
    }

    /// Target the system bus.
    pub fn system_bus(&mut self) -> &mut Self {
        self.bus = BusTarget::System;
        self
    }

    /// Target an explicit bus address instead of the environment.
    pub fn address(&mut self, address: impl Into<String>) -> &mut Self {
        self.bus = BusTarget::Address(address.into());
        self
    }

    /// Reconnect transparently after a disconnect, retrying the interrupted
    /// operation once. Off by default.
    pub fn auto_connect(&mut self, auto_connect: bool) -> &mut Self {
        self.auto_connect = auto_connect;
        self
    }

    /// A default deadline applied to every method call. Unset by default.
    pub fn call_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Marshal handler and callback invocations onto `executor` instead of
    /// running them inline on the connection's receive task.
    pub fn callback_executor(&mut self, executor: Arc<dyn CallbackExecutor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    /// Build the connection without connecting it.
    pub fn build(&self) -> Connection {
        Connection::from_config(Config {
            bus: self.bus.clone(),
            auto_connect: self.auto_connect,
            call_timeout: self.call_timeout,
            executor: self.executor.clone(),
        })
    }

    /// Build the connection and connect it.
    pub async fn connect(&self) -> Result<Connection> {
        let connection = self.build();
        connection.connect().await?;
        Ok(connection)
    }
}

impl Default for ConnectionBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
