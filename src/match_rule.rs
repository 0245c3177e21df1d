//! Match rules selecting which bus traffic is forwarded to a connection.

use std::fmt;

use crate::message::{Message, MessageKind};
use crate::object_path::{ObjectPath, OwnedObjectPath};
use crate::value::Value;

/// A normalized signal match rule.
///
/// The rule is installed on the bus with `AddMatch` and also evaluated
/// locally to route inbound signals to the subscriber that asked for them.
///
/// # Examples
///
/// ```
/// use minibus::MatchRule;
///
/// let rule = MatchRule::signal()
///     .with_interface("org.freedesktop.DBus")
///     .with_member("NameOwnerChanged")
///     .with_arg0("com.example.Name");
///
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.freedesktop.DBus',\
///      member='NameOwnerChanged',arg0='com.example.Name'",
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub(crate) sender: Option<String>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) path: Option<OwnedObjectPath>,
    pub(crate) path_namespace: Option<OwnedObjectPath>,
    pub(crate) arg0: Option<String>,
    pub(crate) arg0_namespace: Option<String>,
}

impl MatchRule {
    /// Construct an empty rule matching every signal.
    pub fn signal() -> Self {
        Self::default()
    }

    /// Match signals from the given sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Match signals emitted from the given interface.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Match signals with the given member.
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Match signals emitted from the given object path.
    pub fn with_path(mut self, path: &ObjectPath) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    /// Match signals emitted from objects at or below the given path.
    pub fn with_path_namespace(mut self, path: &ObjectPath) -> Self {
        self.path_namespace = Some(path.to_owned());
        self
    }

    /// Match signals whose first argument is the given string.
    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Match signals whose first argument is a bus name in the given
    /// dot-separated namespace.
    pub fn with_arg0_namespace(mut self, arg0_namespace: impl Into<String>) -> Self {
        self.arg0_namespace = Some(arg0_namespace.into());
        self
    }

    /// Test whether an inbound signal satisfies this rule.
    pub(crate) fn matches(&self, message: &Message) -> bool {
        let MessageKind::Signal { path, .. } = &message.kind else {
            return false;
        };

        if let Some(sender) = &self.sender {
            if message.sender() != Some(sender.as_str()) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member() != Some(member.as_str()) {
                return false;
            }
        }

        if let Some(expected) = &self.path {
            if **expected != **path {
                return false;
            }
        }

        if let Some(namespace) = &self.path_namespace {
            let path = path.as_str();
            let namespace = namespace.as_str();

            let below = namespace == "/"
                || (path.starts_with(namespace)
                    && (path.len() == namespace.len()
                        || path.as_bytes()[namespace.len()] == b'/'));

            if !below {
                return false;
            }
        }

        if self.arg0.is_some() || self.arg0_namespace.is_some() {
            let Some(Value::String(arg0)) = message.body().first() else {
                return false;
            };

            if let Some(expected) = &self.arg0 {
                if arg0 != expected {
                    return false;
                }
            }

            if let Some(namespace) = &self.arg0_namespace {
                if !in_namespace(arg0, namespace) {
                    return false;
                }
            }
        }

        true
    }
}

/// Test if `name` equals `namespace` or is nested below it.
pub(crate) fn in_namespace(name: &str, namespace: &str) -> bool {
    name == namespace
        || (name.starts_with(namespace) && name.as_bytes().get(namespace.len()) == Some(&b'.'))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type='signal'")?;

        if let Some(sender) = &self.sender {
            write!(f, ",sender='{sender}'")?;
        }

        if let Some(interface) = &self.interface {
            write!(f, ",interface='{interface}'")?;
        }

        if let Some(member) = &self.member {
            write!(f, ",member='{member}'")?;
        }

        if let Some(path) = &self.path {
            write!(f, ",path='{path}'")?;
        }

        if let Some(path_namespace) = &self.path_namespace {
            write!(f, ",path_namespace='{path_namespace}'")?;
        }

        if let Some(arg0) = &self.arg0 {
            write!(f, ",arg0='{arg0}'")?;
        }

        if let Some(arg0_namespace) = &self.arg0_namespace {
            write!(f, ",arg0namespace='{arg0_namespace}'")?;
        }

        Ok(())
    }
}
