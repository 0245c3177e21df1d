//! An asynchronous client library for [D-Bus], the message bus system used
//! on Linux and other Unix-like platforms.
//!
//! The entry point is the [`Connection`]: it owns the authenticated
//! transport and a message pump of two background tasks, and hands out the
//! client surfaces built on top of it — method calls and [`Proxy`] objects,
//! signal subscriptions through [`MatchRule`] and [`Connection::watch`],
//! well-known name ownership through [`NameRequest`], and server-side
//! objects through [`MethodHandler`].
//!
//! [D-Bus]: https://www.freedesktop.org/wiki/Software/dbus/
//!
//! # Examples
//!
//! ```no_run
//! use minibus::{Connection, NameRequest};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> minibus::Result<()> {
//! let c = Connection::session_bus().await?;
//!
//! c.register_name(NameRequest::new("com.example.Service")).await?;
//!
//! let names = c.list_names().await?;
//! assert!(names.iter().any(|name| name == "com.example.Service"));
//! # Ok(()) }
//! ```

#![allow(clippy::module_inception)]

#[macro_use]
mod macros;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::protocol::{Endianness, Flags};
mod protocol;

pub mod address;

#[doc(inline)]
pub use self::signature::{OwnedSignature, Signature, SignatureError};
mod signature;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathError, OwnedObjectPath};
mod object_path;

#[doc(inline)]
pub use self::value::{Array, Dict, Value};
mod value;

#[doc(inline)]
pub use self::message::{Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::match_rule::MatchRule;
mod match_rule;

pub mod wire;

pub mod org_freedesktop_dbus;

mod sasl;

mod transport;

#[doc(inline)]
pub use self::connection::{
    CallbackExecutor, Connection, ConnectionBuilder, ConnectionState, MethodHandler, MethodReply,
    NameRequest, OwnerChange, Proxy, ServiceOwnerObserver, SignalHandler, SubscriptionHandle,
};
mod connection;
