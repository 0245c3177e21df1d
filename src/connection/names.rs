//! Well-known name acquisition and tracking.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::org_freedesktop_dbus::{NameFlag, NameReply, ReleaseNameReply};
use crate::value::Value;

use super::connection::{Connection, Inner};

pub(crate) type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A request for a well-known name.
///
/// # Examples
///
/// ```no_run
/// use minibus::{Connection, NameRequest};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> minibus::Result<()> {
/// let c = Connection::session_bus().await?;
///
/// let request = NameRequest::new("com.example.Service")
///     .with_allow_replacement()
///     .with_on_lost(|name: &str| println!("lost {name}"));
///
/// c.register_name(request).await?;
/// # Ok(()) }
/// ```
pub struct NameRequest {
    pub(crate) name: String,
    pub(crate) allow_replacement: bool,
    pub(crate) replace_existing: bool,
    pub(crate) on_acquired: Option<NameCallback>,
    pub(crate) on_lost: Option<NameCallback>,
}

impl NameRequest {
    /// Construct a request for `name` with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow_replacement: false,
            replace_existing: false,
            on_acquired: None,
            on_lost: None,
        }
    }

    /// Let another connection replace this one as the owner.
    pub fn with_allow_replacement(mut self) -> Self {
        self.allow_replacement = true;
        self
    }

    /// Replace the current owner if it allows replacement.
    pub fn with_replace_existing(mut self) -> Self {
        self.replace_existing = true;
        self
    }

    /// Invoke `callback` whenever the name is acquired.
    pub fn with_on_acquired(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_acquired = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` whenever the name is lost to another connection.
    /// Requires [`with_allow_replacement`].
    ///
    /// [`with_allow_replacement`]: Self::with_allow_replacement
    pub fn with_on_lost(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_lost = Some(Arc::new(callback));
        self
    }
}

/// Tracked state of a requested name.
pub(crate) struct NameState {
    queued: bool,
    owned: bool,
    on_acquired: Option<NameCallback>,
    on_lost: Option<NameCallback>,
}

impl NameState {
    /// The callback to fire when the link carrying the name dies, if the
    /// name was held.
    pub(crate) fn lost_callback(&self) -> Option<NameCallback> {
        if self.owned {
            self.on_lost.clone()
        } else {
            None
        }
    }
}

impl Connection {
    /// Request exclusive ownership of a well-known name.
    ///
    /// The request does not queue: if the name cannot be acquired
    /// immediately the call fails with an invalid operation error.
    pub async fn register_name(&self, request: NameRequest) -> Result<()> {
        self.request_name(request, false).await
    }

    /// Request ownership of a well-known name, queueing behind the current
    /// owner if there is one. `on_acquired` and `on_lost` fire on every
    /// subsequent transition while the registration is alive.
    pub async fn queue_name(&self, request: NameRequest) -> Result<()> {
        self.request_name(request, true).await
    }

    async fn request_name(&self, request: NameRequest, queue: bool) -> Result<()> {
        if request.on_lost.is_some() && !request.allow_replacement {
            return Err(Error::invalid_operation(
                "an on_lost callback requires allow_replacement",
            ));
        }

        self.ensure_connected().await?;

        let mut flags = NameFlag::default();

        if request.allow_replacement {
            flags = flags | NameFlag::ALLOW_REPLACEMENT;
        }

        if request.replace_existing {
            flags = flags | NameFlag::REPLACE_EXISTING;
        }

        if queue {
            // A queued request takes the name over immediately when the
            // current owner allows replacement.
            flags = flags | NameFlag::REPLACE_EXISTING;
        } else {
            flags = flags | NameFlag::DO_NOT_QUEUE;
        }

        let name = request.name.clone();

        // The entry is registered before the call goes out so the
        // NameAcquired signal, which the bus emits before the reply, finds
        // it.
        {
            let mut s = self.inner.shared();

            if s.names.contains_key(&name) {
                return Err(Error::invalid_operation(
                    "name already requested on this connection",
                ));
            }

            s.names.insert(
                name.clone(),
                NameState {
                    queued: queue,
                    owned: false,
                    on_acquired: request.on_acquired,
                    on_lost: request.on_lost,
                },
            );
        }

        let m = self
            .bus_call("RequestName")
            .with_arg(name.as_str())
            .with_arg(flags.0);

        let reply = match self.call(m).await {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.shared().names.remove(&name);
                return Err(e);
            }
        };

        let drop_entry = |error: Error| {
            self.inner.shared().names.remove(&name);
            Err(error)
        };

        let Some(code) = reply.body().first().and_then(Value::as_u32) else {
            return drop_entry(Error::protocol("RequestName reply carried no code"));
        };

        match NameReply(code) {
            NameReply::PRIMARY_OWNER => {
                mark_acquired(&self.inner, &name);
                Ok(())
            }
            NameReply::IN_QUEUE => {
                if queue {
                    Ok(())
                } else {
                    // The bus must not queue a DO_NOT_QUEUE request.
                    drop_entry(Error::protocol("bus queued a non-queueing request"))
                }
            }
            NameReply::EXISTS => {
                if queue {
                    drop_entry(Error::protocol("bus refused a queueing request"))
                } else {
                    drop_entry(Error::invalid_operation(
                        "name is owned by another connection",
                    ))
                }
            }
            NameReply::ALREADY_OWNER => {
                if queue {
                    drop_entry(Error::protocol("bus reported an unrequested name as owned"))
                } else {
                    drop_entry(Error::invalid_operation(
                        "name is already owned by this connection",
                    ))
                }
            }
            _ => drop_entry(Error::protocol("unknown RequestName reply code")),
        }
    }

    /// Release a name acquired with [`register_name`] or [`queue_name`].
    /// Returns `true` if this connection owned or was queued for the name.
    ///
    /// [`register_name`]: Self::register_name
    /// [`queue_name`]: Self::queue_name
    pub async fn release_name(&self, name: &str) -> Result<bool> {
        self.ensure_connected().await?;

        let m = self.bus_call("ReleaseName").with_arg(name);
        let reply = self.call(m).await?;

        self.inner.shared().names.remove(name);

        let Some(code) = reply.body().first().and_then(Value::as_u32) else {
            return Err(Error::protocol("ReleaseName reply carried no code"));
        };

        Ok(ReleaseNameReply(code) == ReleaseNameReply::RELEASED)
    }
}

/// Handle `NameAcquired` and `NameLost`, which the bus targets at this
/// connection without a match rule.
pub(crate) fn handle_bus_signal(inner: &Arc<Inner>, message: &Message) {
    let Some(name) = message.body().first().and_then(Value::as_str) else {
        return;
    };

    match message.member() {
        Some("NameAcquired") => mark_acquired(inner, name),
        Some("NameLost") => mark_lost(inner, name),
        _ => {}
    }
}

/// Transition a tracked name to owned, firing `on_acquired` once per
/// transition. Both the `RequestName` reply and the `NameAcquired` signal
/// funnel through here, so whichever arrives first wins.
fn mark_acquired(inner: &Arc<Inner>, name: &str) {
    let callback = {
        let mut s = inner.shared();

        match s.names.get_mut(name) {
            Some(state) if !state.owned => {
                state.owned = true;
                state.on_acquired.clone()
            }
            _ => None,
        }
    };

    if let Some(callback) = callback {
        let name = name.to_owned();
        inner.execute(move || callback(&name));
    }
}

/// Transition a tracked name to lost. Queued registrations stay tracked and
/// may re-acquire; non-queued ones drop out.
fn mark_lost(inner: &Arc<Inner>, name: &str) {
    let callback = {
        let mut s = inner.shared();

        match s.names.get_mut(name) {
            Some(state) if state.owned => {
                state.owned = false;
                let callback = state.on_lost.clone();

                if !state.queued {
                    s.names.remove(name);
                }

                callback
            }
            _ => None,
        }
    };

    if let Some(callback) = callback {
        let name = name.to_owned();
        inner.execute(move || callback(&name));
    }
}
