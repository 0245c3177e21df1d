//! Types associated with the `org.freedesktop.DBus` interface.

use crate::object_path::ObjectPath;

/// Well known destination name of the bus itself.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Interface of the message bus.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Interface of the standard properties methods.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Interface of the standard introspection method.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Well known D-Bus path of the bus itself.
pub const PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");

/// Error name the bus replies with when a method call addresses an object
/// this connection has not registered.
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

/// Error name used when a registered object does not handle a member.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Error name the bus replies with when a name has no current owner.
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

raw_set! {
    /// The flags to a `RequestName` call.
    #[repr(u32)]
    pub(crate) enum NameFlag {
        /// Let another connection that requests the name with
        /// `REPLACE_EXISTING` take it over.
        ALLOW_REPLACEMENT = 1,
        /// Replace the current owner if it specified `ALLOW_REPLACEMENT`.
        REPLACE_EXISTING = 2,
        /// Fail instead of queueing if the name cannot be acquired
        /// immediately, and drop out instead of re-queueing when it is lost
        /// later.
        DO_NOT_QUEUE = 4,
    }
}

raw_enum! {
    /// The reply to a `RequestName` call.
    #[repr(u32)]
    pub(crate) enum NameReply {
        /// The caller is now the primary owner.
        PRIMARY_OWNER = 1,
        /// The name has an owner and the caller has been queued for it.
        IN_QUEUE = 2,
        /// The name has an owner, `DO_NOT_QUEUE` was specified and no
        /// replacement was possible.
        EXISTS = 3,
        /// The caller already owns the name.
        ALREADY_OWNER = 4,
    }
}

raw_enum! {
    /// The reply to a `ReleaseName` call.
    #[repr(u32)]
    pub(crate) enum ReleaseNameReply {
        /// The name existed, the caller owned or was queued for it, and it
        /// has been released.
        RELEASED = 1,
        /// The name does not exist on the bus.
        NON_EXISTENT = 2,
        /// The caller neither owns nor is queued for the name.
        NOT_OWNER = 3,
    }
}
