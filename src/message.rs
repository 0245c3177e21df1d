//! D-Bus messages and their construction.

use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::object_path::{ObjectPath, OwnedObjectPath};
use crate::protocol::Flags;
use crate::signature::OwnedSignature;
use crate::value::Value;

/// The kind of a D-Bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// Method call, may prompt a reply.
    MethodCall {
        /// The path of the object being called.
        path: OwnedObjectPath,
        /// The member being called.
        member: String,
    },
    /// Method reply with returned data.
    MethodReturn {
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Error reply. If the first body argument is a string, it is an error
    /// message.
    Error {
        /// The name of the error.
        error_name: String,
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Signal emission.
    Signal {
        /// The path of the object emitting the signal.
        path: OwnedObjectPath,
        /// The member being signalled.
        member: String,
    },
}

/// A D-Bus message.
///
/// Outbound messages are constructed through [`Message::method_call`],
/// [`Message::signal`] and the `with_*` modifiers; their serial is assigned
/// by the connection when the message is sent. Inbound messages always carry
/// the serial the peer assigned.
///
/// # Examples
///
/// ```
/// use minibus::{Message, ObjectPath, Value};
///
/// const PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");
///
/// let m = Message::method_call(PATH, "RequestName")
///     .with_interface("org.freedesktop.DBus")
///     .with_destination("org.freedesktop.DBus")
///     .with_arg("com.example.Name")
///     .with_arg(0u32);
///
/// assert_eq!(m.signature().as_str(), "su");
/// ```
#[derive(Debug)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) serial: Option<NonZeroU32>,
    pub(crate) flags: Flags,
    pub(crate) interface: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) body: Vec<Value>,
    pub(crate) fds: Vec<OwnedFd>,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: None,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            body: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Construct a method call.
    pub fn method_call(path: &ObjectPath, member: &str) -> Self {
        Self::new(MessageKind::MethodCall {
            path: path.to_owned(),
            member: member.into(),
        })
    }

    /// Construct a method return replying to `reply_serial`.
    pub fn method_return(reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::MethodReturn { reply_serial })
    }

    /// Construct an error replying to `reply_serial`.
    pub fn error(error_name: &str, reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::Error {
            error_name: error_name.into(),
            reply_serial,
        })
    }

    /// Construct a signal.
    pub fn signal(path: &ObjectPath, interface: &str, member: &str) -> Self {
        Self::new(MessageKind::Signal {
            path: path.to_owned(),
            member: member.into(),
        })
        .with_interface(interface)
    }

    /// The kind of the message.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The serial of the message, if one has been assigned.
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    /// The flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Modify the flags of the message.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// The interface of the message.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Modify the interface of the message.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// The destination of the message.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Modify the destination of the message.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// The sender of the message. On messages received over a bus this is
    /// filled in by the bus daemon.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Modify the sender of the message. A bus overwrites this on every
    /// message it forwards, so setting it is only meaningful for tooling
    /// that plays the bus side itself.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// The body arguments of the message.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the body arguments out of the message.
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Replace the body arguments of the message.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Append a single body argument.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.body.push(arg.into());
        self
    }

    /// The file descriptors attached to the message. For received messages
    /// these are owned by the message and closed when it is dropped.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Attach a file descriptor, returning the message and the index a
    /// [`Value::UnixFd`] body argument should refer to it by.
    pub fn with_fd(mut self, fd: OwnedFd) -> (Self, u32) {
        self.fds.push(fd);
        let index = (self.fds.len() - 1) as u32;
        (self, index)
    }

    /// Take ownership of the attached file descriptors.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// The signature of the message body.
    pub fn signature(&self) -> OwnedSignature {
        let mut out = String::new();

        for value in &self.body {
            out.push_str(value.signature().as_str());
        }

        OwnedSignature::from_string_unchecked(out)
    }

    /// The object path of the message, for method calls and signals.
    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The member of the message, for method calls and signals.
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The error name, for errors.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Error { error_name, .. } => Some(error_name),
            _ => None,
        }
    }

    /// The serial this message replies to, for method returns and errors.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match &self.kind {
            MessageKind::MethodReturn { reply_serial } => Some(*reply_serial),
            MessageKind::Error { reply_serial, .. } => Some(*reply_serial),
            _ => None,
        }
    }

    /// Test if the message expects a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall { .. })
            && !(self.flags & Flags::NO_REPLY_EXPECTED)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.serial == other.serial
            && self.flags == other.flags
            && self.interface == other.interface
            && self.destination == other.destination
            && self.sender == other.sender
            && self.body == other.body
            && self.fds.len() == other.fds.len()
    }
}
