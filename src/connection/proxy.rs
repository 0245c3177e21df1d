//! The raw client-side proxy API.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::object_path::{ObjectPath, OwnedObjectPath};
use crate::org_freedesktop_dbus as bus;
use crate::value::Value;

use super::connection::Connection;

/// A handle on a remote object: a `(destination, path)` pair bound to a
/// connection.
///
/// This is the raw calling surface that generated bindings sit on top of.
///
/// # Examples
///
/// ```no_run
/// use minibus::{Connection, ObjectPath, Value};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> minibus::Result<()> {
/// let c = Connection::session_bus().await?;
///
/// let proxy = c.proxy(
///     "org.freedesktop.Notifications",
///     ObjectPath::new_const(b"/org/freedesktop/Notifications"),
/// );
///
/// let caps = proxy
///     .call("org.freedesktop.Notifications", "GetCapabilities", vec![])
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Proxy {
    connection: Connection,
    destination: String,
    path: OwnedObjectPath,
}

impl Proxy {
    pub(crate) fn new(connection: Connection, destination: String, path: OwnedObjectPath) -> Self {
        Self {
            connection,
            destination,
            path,
        }
    }

    /// The connection the proxy operates on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The destination the proxy addresses.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The object path the proxy addresses.
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    fn message(&self, interface: &str, member: &str, args: Vec<Value>) -> Message {
        Message::method_call(&self.path, member)
            .with_interface(interface)
            .with_destination(self.destination.clone())
            .with_body(args)
    }

    /// Call a method and return its reply arguments.
    pub async fn call(
        &self,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let reply = self.connection.call(self.message(interface, member, args)).await?;
        Ok(reply.into_body())
    }

    /// Call a method with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        interface: &str,
        member: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let reply = self
            .connection
            .call_with_timeout(self.message(interface, member, args), timeout)
            .await?;

        Ok(reply.into_body())
    }

    /// Read a property through `org.freedesktop.DBus.Properties`.
    pub async fn get(&self, interface: &str, property: &str) -> Result<Value> {
        let mut reply = self
            .call(
                bus::PROPERTIES_INTERFACE,
                "Get",
                vec![interface.into(), property.into()],
            )
            .await?;

        match reply.pop() {
            Some(Value::Variant(inner)) if reply.is_empty() => Ok(*inner),
            _ => Err(Error::protocol("property Get reply carried no variant")),
        }
    }

    /// Write a property through `org.freedesktop.DBus.Properties`.
    pub async fn set(&self, interface: &str, property: &str, value: Value) -> Result<()> {
        self.call(
            bus::PROPERTIES_INTERFACE,
            "Set",
            vec![
                interface.into(),
                property.into(),
                Value::Variant(Box::new(value)),
            ],
        )
        .await?;

        Ok(())
    }

    /// Fetch the introspection XML of the remote object.
    pub async fn introspect(&self) -> Result<String> {
        let mut reply = self
            .call(bus::INTROSPECTABLE_INTERFACE, "Introspect", vec![])
            .await?;

        match reply.pop() {
            Some(Value::String(xml)) if reply.is_empty() => Ok(xml),
            _ => Err(Error::protocol("Introspect reply carried no string")),
        }
    }
}
