use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;
use std::sync::Arc;

use crate::object_path::ObjectPathError;
use crate::signature::SignatureError;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Arc<ErrorKind>,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn address(message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::Address(message.into()))
    }

    pub(crate) fn connect(message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::Connect(message.into()))
    }

    pub(crate) fn auth(message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::Auth(message.into()))
    }

    pub(crate) fn protocol(message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::Protocol(message.into()))
    }

    pub(crate) fn invalid_operation(message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::InvalidOperation(message.into()))
    }

    pub(crate) fn method_error(name: impl Into<Box<str>>, message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::MethodError(name.into(), message.into()))
    }

    pub(crate) fn disconnected(cause: Option<Error>) -> Self {
        Self::new(ErrorKind::Disconnected(cause))
    }

    #[inline]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The D-Bus error name if this error is a reply reported by a remote
    /// peer, such as `org.freedesktop.DBus.Error.NameHasNoOwner`.
    pub fn error_name(&self) -> Option<&str> {
        match &*self.kind {
            ErrorKind::MethodError(name, _) => Some(name),
            _ => None,
        }
    }

    /// Test if the error indicates that the connection has been terminated.
    pub fn is_disconnected(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Disconnected(..))
    }

    /// Test if the error indicates that a call deadline elapsed.
    pub fn is_timed_out(&self) -> bool {
        matches!(&*self.kind, ErrorKind::TimedOut)
    }

    /// Test if the error indicates use of a disposed connection.
    pub fn is_disposed(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Disposed)
    }

    /// Test if the error reports API misuse, such as requesting a name that
    /// is already owned or connecting twice.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(&*self.kind, ErrorKind::InvalidOperation(..))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::ObjectPath(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8(error))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Signature(error) => error.fmt(f),
            ErrorKind::ObjectPath(error) => error.fmt(f),
            ErrorKind::Utf8(error) => error.fmt(f),
            ErrorKind::Address(message) => write!(f, "Invalid bus address: {message}"),
            ErrorKind::Connect(message) => write!(f, "Unable to reach the bus: {message}"),
            ErrorKind::Auth(message) => write!(f, "Authentication failed: {message}"),
            ErrorKind::Protocol(message) => write!(f, "Protocol violation: {message}"),
            ErrorKind::ZeroSerial => write!(f, "Zero message serial"),
            ErrorKind::MissingRequiredField(name) => {
                write!(f, "Missing required {name} header field")
            }
            ErrorKind::MessageTooLong(length) => {
                write!(f, "Message of {length} bytes exceeds maximum size")
            }
            ErrorKind::MethodError(name, message) if message.is_empty() => {
                write!(f, "{name}")
            }
            ErrorKind::MethodError(name, message) => write!(f, "{name}: {message}"),
            ErrorKind::Disconnected(Some(cause)) => {
                write!(f, "Connection closed: {cause}")
            }
            ErrorKind::Disconnected(None) => write!(f, "Connection closed"),
            ErrorKind::InvalidOperation(message) => write!(f, "{message}"),
            ErrorKind::TimedOut => write!(f, "Method call timed out"),
            ErrorKind::Disposed => write!(f, "Connection has been disposed"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &*self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::ObjectPath(error) => Some(error),
            ErrorKind::Utf8(error) => Some(error),
            ErrorKind::Disconnected(Some(cause)) => Some(cause),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    ObjectPath(ObjectPathError),
    Utf8(Utf8Error),
    Address(Box<str>),
    Connect(Box<str>),
    Auth(Box<str>),
    Protocol(Box<str>),
    ZeroSerial,
    MissingRequiredField(&'static str),
    MessageTooLong(u64),
    MethodError(Box<str>, Box<str>),
    Disconnected(Option<Error>),
    InvalidOperation(Box<str>),
    TimedOut,
    Disposed,
}
