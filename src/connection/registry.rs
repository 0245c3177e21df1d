//! The registry of objects this connection exposes to other peers.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::object_path::ObjectPath;
use crate::value::Value;

use super::connection::{Connection, ConnectionState};

/// The outcome of a handled method call.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodReply {
    /// A successful reply carrying the returned arguments.
    Return(Vec<Value>),
    /// An error reply.
    Error {
        /// The D-Bus error name.
        name: String,
        /// A human readable message, sent as the first argument.
        message: String,
    },
}

/// A handler for method calls addressed to a registered object path.
///
/// The handler runs on the connection's receive task, or on the configured
/// callback executor, with calls delivered in arrival order. Returning
/// `None` means the member is not handled and the caller receives
/// `org.freedesktop.DBus.Error.UnknownMethod`; any reply is discarded when
/// the call was flagged `NO_REPLY_EXPECTED`.
pub trait MethodHandler: Send + Sync {
    fn handle(&self, call: &Message) -> Option<MethodReply>;
}

impl<F> MethodHandler for F
where
    F: Fn(&Message) -> Option<MethodReply> + Send + Sync,
{
    fn handle(&self, call: &Message) -> Option<MethodReply> {
        self(call)
    }
}

impl Connection {
    /// Expose an object at `path`. Fails if the path is already bound or
    /// the connection is disposed.
    pub fn register_object(
        &self,
        path: &ObjectPath,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        let mut s = self.inner.shared();

        if s.state == ConnectionState::Disposed {
            return Err(Error::new(crate::error::ErrorKind::Disposed));
        }

        if s.handlers.contains_key(path) {
            return Err(Error::invalid_operation(
                "an object is already registered at this path",
            ));
        }

        s.handlers.insert(path.to_owned(), handler);
        Ok(())
    }

    /// Remove the object registered at `path`, returning whether one was
    /// bound there.
    pub fn unregister_object(&self, path: &ObjectPath) -> bool {
        self.inner.shared().handlers.remove(path).is_some()
    }
}
