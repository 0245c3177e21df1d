use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::address::{self, Address};
use crate::error::{Error, ErrorKind, Result};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageKind};
use crate::object_path::{ObjectPath, OwnedObjectPath};
use crate::org_freedesktop_dbus as bus;
use crate::protocol::Endianness;
use crate::transport::connect_any;
use crate::value::Value;
use crate::{sasl, wire};

use super::names::NameState;
use super::pump;
use super::registry::MethodHandler;
use super::signals::{SignalHandler, StateWatcher};
use super::{CallbackExecutor, ConnectionBuilder, Proxy};

/// The lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Built but never connected.
    Created,
    /// A connection attempt is in progress.
    Connecting,
    /// Authenticated and exchanging messages.
    Connected,
    /// The transport has been lost or shut down.
    Disconnected,
    /// The connection has been disposed and can no longer be used.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Created => write!(f, "created"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Which bus the connection targets.
#[derive(Debug, Clone)]
pub(crate) enum BusTarget {
    Session,
    System,
    Address(String),
}

pub(crate) struct Config {
    pub(crate) bus: BusTarget,
    pub(crate) auto_connect: bool,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) executor: Option<Arc<dyn CallbackExecutor>>,
}

/// A single encoded message handed to the writer task. The descriptors are
/// closed once the frame has been written, successfully or not.
pub(crate) struct Frame {
    pub(crate) bytes: Vec<u8>,
    pub(crate) fds: Vec<OwnedFd>,
}

/// The artifacts of a live transport link.
pub(crate) struct Link {
    pub(crate) writer: UnboundedSender<Frame>,
    pub(crate) reader_task: JoinHandle<()>,
    pub(crate) writer_task: JoinHandle<()>,
}

pub(crate) struct Subscription {
    pub(crate) rule: MatchRule,
    pub(crate) rule_key: String,
    pub(crate) handler: Arc<dyn SignalHandler>,
}

/// State shared between the connection façade and the pump tasks, guarded by
/// the single connection lock. User code is never invoked while it is held.
pub(crate) struct Shared {
    pub(crate) state: ConnectionState,
    pub(crate) last_error: Option<Error>,
    pub(crate) link: Option<Link>,
    pub(crate) epoch: u64,
    pub(crate) serial: u32,
    pub(crate) pending: HashMap<u32, oneshot::Sender<Result<Message>>>,
    pub(crate) subscriptions: HashMap<u64, Subscription>,
    pub(crate) next_subscription: u64,
    pub(crate) rules: HashMap<String, usize>,
    pub(crate) handlers: HashMap<OwnedObjectPath, Arc<dyn MethodHandler>>,
    pub(crate) names: HashMap<String, NameState>,
    pub(crate) state_watchers: Vec<StateWatcher>,
    pub(crate) unique_name: Option<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: ConnectionState::Created,
            last_error: None,
            link: None,
            epoch: 0,
            serial: 0,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
            rules: HashMap::new(),
            handlers: HashMap::new(),
            names: HashMap::new(),
            state_watchers: Vec::new(),
            unique_name: None,
        }
    }

    /// Allocate the next serial, skipping zero and serials with an
    /// outstanding reply.
    pub(crate) fn next_serial(&mut self) -> NonZeroU32 {
        loop {
            self.serial = self.serial.wrapping_add(1);

            if let Some(serial) = NonZeroU32::new(self.serial) {
                if !self.pending.contains_key(&serial.get()) {
                    return serial;
                }
            }
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    /// Serializes connection attempts.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    pub(crate) shared: Mutex<Shared>,
}

impl Inner {
    pub(crate) fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run a callback, inline or on the configured executor.
    pub(crate) fn execute(&self, task: impl FnOnce() + Send + 'static) {
        match &self.config.executor {
            Some(executor) => executor.spawn(Box::new(task)),
            None => task(),
        }
    }

    /// Queue an outbound message, assigning its serial.
    pub(crate) fn send_message(&self, mut message: Message) -> Result<NonZeroU32> {
        let mut s = self.shared();

        match s.state {
            ConnectionState::Connected => {}
            ConnectionState::Disposed => return Err(Error::new(ErrorKind::Disposed)),
            _ => return Err(Error::disconnected(s.last_error.clone())),
        }

        let serial = s.next_serial();
        let bytes = wire::encode_message(&message, serial, Endianness::NATIVE)?;
        let fds = mem::take(&mut message.fds);

        let Some(link) = &s.link else {
            return Err(Error::disconnected(s.last_error.clone()));
        };

        if link.writer.send(Frame { bytes, fds }).is_err() {
            return Err(Error::disconnected(s.last_error.clone()));
        }

        Ok(serial)
    }

    pub(crate) fn fire_state_change(&self, state: ConnectionState, error: Option<Error>) {
        let watchers = self.shared().state_watchers.clone();

        if watchers.is_empty() {
            return;
        }

        self.execute(move || {
            for watcher in watchers {
                watcher(state, error.as_ref());
            }
        });
    }

    /// Tear the connection down for good.
    pub(crate) fn dispose(&self) {
        let (pending, link) = {
            let mut s = self.shared();

            if s.state == ConnectionState::Disposed {
                return;
            }

            s.state = ConnectionState::Disposed;
            s.unique_name = None;
            s.handlers.clear();
            s.subscriptions.clear();
            s.rules.clear();
            s.names.clear();
            (mem::take(&mut s.pending), s.link.take())
        };

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::disconnected(None)));
        }

        if let Some(link) = link {
            link.reader_task.abort();
            link.writer_task.abort();
        }

        self.fire_state_change(ConnectionState::Disposed, None);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let s = match self.shared.get_mut() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (_, tx) in s.pending.drain() {
            let _ = tx.send(Err(Error::disconnected(None)));
        }

        if let Some(link) = s.link.take() {
            link.reader_task.abort();
            link.writer_task.abort();
        }
    }
}

/// An asynchronous connection to a D-Bus message bus.
///
/// The connection is a cheaply cloneable handle. It owns a message pump of
/// two background tasks which serialize outbound messages onto the wire and
/// dispatch inbound traffic to pending calls, signal subscriptions and
/// registered objects.
///
/// # Examples
///
/// ```no_run
/// use minibus::Connection;
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> minibus::Result<()> {
/// let c = Connection::session_bus().await?;
/// println!("connected as {:?}", c.unique_name());
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Construct a builder to configure a connection.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Connect to the session bus using the default configuration.
    pub async fn session_bus() -> Result<Self> {
        Self::builder().connect().await
    }

    /// Connect to the system bus using the default configuration.
    pub async fn system_bus() -> Result<Self> {
        Self::builder().system_bus().connect().await
    }

    pub(crate) fn from_config(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connect_lock: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared::new()),
            }),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared().state
    }

    /// The unique name the bus assigned to this connection, stable for the
    /// lifetime of the link.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.shared().unique_name.clone()
    }

    /// Register a watcher invoked on every state transition. On disconnect
    /// the watcher receives the error that caused it.
    pub fn on_state_change(
        &self,
        watcher: impl Fn(ConnectionState, Option<&Error>) + Send + Sync + 'static,
    ) {
        self.inner.shared().state_watchers.push(Arc::new(watcher));
    }

    /// Connect to the configured bus.
    ///
    /// Without auto-connect this succeeds at most once; a second call fails
    /// with an invalid operation error. With auto-connect the call is
    /// idempotent and may be repeated after a disconnect.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        {
            let mut s = self.inner.shared();

            match s.state {
                ConnectionState::Created => {}
                ConnectionState::Connected => {
                    return if self.inner.config.auto_connect {
                        Ok(())
                    } else {
                        Err(Error::invalid_operation("connection is already connected"))
                    };
                }
                ConnectionState::Disconnected => {
                    if !self.inner.config.auto_connect {
                        return Err(Error::invalid_operation(
                            "connect may only be attempted once",
                        ));
                    }
                }
                ConnectionState::Connecting => {
                    // Unreachable while holding the connect lock, treat it
                    // as a connection in progress.
                    return Err(Error::invalid_operation("connection attempt in progress"));
                }
                ConnectionState::Disposed => return Err(Error::new(ErrorKind::Disposed)),
            }

            s.state = ConnectionState::Connecting;
        }

        self.inner.fire_state_change(ConnectionState::Connecting, None);

        match self.do_connect().await {
            Ok(()) => {
                self.inner.fire_state_change(ConnectionState::Connected, None);
                Ok(())
            }
            Err(e) => {
                {
                    let mut s = self.inner.shared();

                    if s.state != ConnectionState::Disposed {
                        s.state = ConnectionState::Disconnected;
                        s.last_error = Some(e.clone());

                        if let Some(link) = s.link.take() {
                            link.reader_task.abort();
                            link.writer_task.abort();
                        }
                    }
                }

                self.inner
                    .fire_state_change(ConnectionState::Disconnected, Some(e.clone()));
                Err(e)
            }
        }
    }

    async fn do_connect(&self) -> Result<()> {
        let addresses = self.resolve_addresses()?;
        let (transport, address) = connect_any(&addresses).await?;

        // The credentials nul byte precedes all SASL traffic.
        transport.send(b"\0").await?;

        let negotiate_fd = transport.supports_fd_passing();
        let outcome = sasl::authenticate(&transport, address.guid(), negotiate_fd).await?;
        let write_half = transport.try_clone()?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let epoch = {
            let mut s = self.inner.shared();
            s.epoch += 1;
            s.serial = 0;
            s.epoch
        };

        let weak = Arc::downgrade(&self.inner);
        let reader_task = tokio::spawn(pump::read_loop(
            weak.clone(),
            transport,
            outcome.leftover,
            epoch,
        ));
        let writer_task = tokio::spawn(pump::write_loop(weak, write_half, writer_rx, epoch));

        {
            let mut s = self.inner.shared();

            if s.state != ConnectionState::Connecting {
                // The link already failed while it was being set up.
                let cause = s.last_error.clone();
                reader_task.abort();
                writer_task.abort();
                return Err(cause.unwrap_or_else(|| Error::connect("connection lost during setup")));
            }

            s.link = Some(Link {
                writer: writer_tx,
                reader_task,
                writer_task,
            });
            s.state = ConnectionState::Connected;
        }

        tracing::debug!(guid = %outcome.guid, unix_fd = outcome.unix_fd, "connected");

        let hello = Message::method_call(bus::PATH, "Hello")
            .with_interface(bus::INTERFACE)
            .with_destination(bus::DESTINATION);

        let reply = self.call_once(hello, self.inner.config.call_timeout).await?;

        let name = reply
            .body()
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("Hello reply carried no name"))?
            .to_owned();

        self.inner.shared().unique_name = Some(name);

        // Reinstall the match rules of subscriptions that survived a
        // previous link.
        let rules = {
            let s = self.inner.shared();
            s.rules.keys().cloned().collect::<Vec<_>>()
        };

        for rule in rules {
            let m = Message::method_call(bus::PATH, "AddMatch")
                .with_interface(bus::INTERFACE)
                .with_destination(bus::DESTINATION)
                .with_arg(rule);

            self.call_once(m, self.inner.config.call_timeout).await?;
        }

        Ok(())
    }

    fn resolve_addresses(&self) -> Result<Vec<Address>> {
        match &self.inner.config.bus {
            BusTarget::Session => address::session_bus_address(),
            BusTarget::System => address::system_bus_address(),
            BusTarget::Address(s) => address::parse_addresses(s),
        }
    }

    /// Make sure the connection is usable, reconnecting when auto-connect
    /// permits it.
    pub(crate) async fn ensure_connected(&self) -> Result<()> {
        loop {
            let (state, last_error) = {
                let s = self.inner.shared();
                (s.state, s.last_error.clone())
            };

            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disposed => return Err(Error::new(ErrorKind::Disposed)),
                ConnectionState::Created => {
                    if !self.inner.config.auto_connect {
                        return Err(Error::invalid_operation("connection is not connected"));
                    }

                    self.connect().await?;
                }
                ConnectionState::Disconnected => {
                    if !self.inner.config.auto_connect {
                        return Err(Error::disconnected(last_error));
                    }

                    self.connect().await?;
                }
                ConnectionState::Connecting => {
                    // Wait for the in-flight attempt and look again.
                    drop(self.inner.connect_lock.lock().await);
                }
            }
        }
    }

    /// Send a method call and await its reply.
    ///
    /// The message must expect a reply; use [`send`] for signals and
    /// fire-and-forget calls.
    ///
    /// [`send`]: Self::send
    pub async fn call(&self, message: Message) -> Result<Message> {
        self.call_with_deadline(message, self.inner.config.call_timeout)
            .await
    }

    /// Send a method call and await its reply, failing with a timeout error
    /// when the deadline elapses.
    pub async fn call_with_timeout(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.call_with_deadline(message, Some(timeout)).await
    }

    async fn call_with_deadline(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.ensure_connected().await?;

        // A disconnected call is transparently retried once under
        // auto-connect. Messages carrying descriptors are not: their
        // descriptors are consumed by the first attempt.
        let retry = self.inner.config.auto_connect && message.fds.is_empty();

        if !retry {
            return self.call_once(message, timeout).await;
        }

        match self.call_once(clone_without_fds(&message), timeout).await {
            Err(e) if e.is_disconnected() => {
                self.ensure_connected().await?;
                self.call_once(message, timeout).await
            }
            other => other,
        }
    }

    pub(crate) async fn call_once(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        if !message.expects_reply() {
            return Err(Error::invalid_operation(
                "message does not expect a reply, use send",
            ));
        }

        let (serial, rx) = {
            let mut s = self.inner.shared();

            match s.state {
                ConnectionState::Connected => {}
                ConnectionState::Disposed => return Err(Error::new(ErrorKind::Disposed)),
                _ => return Err(Error::disconnected(s.last_error.clone())),
            }

            let mut message = message;
            let serial = s.next_serial();
            let bytes = wire::encode_message(&message, serial, Endianness::NATIVE)?;
            let fds = mem::take(&mut message.fds);

            let (tx, rx) = oneshot::channel();
            // The pending entry is registered before the frame reaches the
            // writer, so a reply can never beat it.
            s.pending.insert(serial.get(), tx);

            let send = match &s.link {
                Some(link) => link.writer.send(Frame { bytes, fds }).is_ok(),
                None => false,
            };

            if !send {
                s.pending.remove(&serial.get());
                return Err(Error::disconnected(s.last_error.clone()));
            }

            (serial, rx)
        };

        let mut pending = PendingCall {
            inner: &self.inner,
            serial: serial.get(),
            armed: true,
        };

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(..) => return Err(Error::new(ErrorKind::TimedOut)),
            },
            None => rx.await,
        };

        pending.armed = false;

        let reply = received.map_err(|_| Error::disconnected(None))??;

        match &reply.kind {
            MessageKind::Error { error_name, .. } => {
                let text = reply
                    .body()
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                Err(Error::method_error(error_name.clone(), text))
            }
            _ => Ok(reply),
        }
    }

    /// Queue a message that does not expect a reply: a signal, a reply, or a
    /// method call flagged `NO_REPLY_EXPECTED`.
    pub fn send(&self, message: Message) -> Result<()> {
        if message.expects_reply() {
            return Err(Error::invalid_operation(
                "message expects a reply, use call",
            ));
        }

        self.inner.send_message(message)?;
        Ok(())
    }

    /// Construct a proxy for an object exposed by another connection.
    pub fn proxy(&self, destination: impl Into<String>, path: &ObjectPath) -> Proxy {
        Proxy::new(self.clone(), destination.into(), path.to_owned())
    }

    /// Shut the connection down and release every resource.
    ///
    /// Pending calls resolve with a disconnect error. Disposal is idempotent
    /// and safe to call from any task.
    pub fn close(&self) {
        self.inner.dispose();
    }

    /// Ask the bus whether a name currently has an owner.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let m = self.bus_call("NameHasOwner").with_arg(name);
        let reply = self.call(m).await?;

        reply
            .body()
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::protocol("NameHasOwner reply carried no boolean"))
    }

    /// List the names currently owned on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call(self.bus_call("ListNames")).await?;
        string_array(&reply)
    }

    /// List the names that can be activated on the bus.
    pub async fn list_activatable_names(&self) -> Result<Vec<String>> {
        let reply = self.call(self.bus_call("ListActivatableNames")).await?;
        string_array(&reply)
    }

    /// Ask the bus to launch the service for a name. Returns `true` if the
    /// service was started and `false` if it was already running.
    pub async fn start_service_by_name(&self, name: &str) -> Result<bool> {
        let m = self
            .bus_call("StartServiceByName")
            .with_arg(name)
            .with_arg(0u32);

        let reply = self.call(m).await?;

        let code = reply
            .body()
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| Error::protocol("StartServiceByName reply carried no code"))?;

        Ok(code == 1)
    }

    /// The current owner of a name, or `None` when it has none.
    pub async fn get_name_owner(&self, name: &str) -> Result<Option<String>> {
        let m = self.bus_call("GetNameOwner").with_arg(name);

        match self.call(m).await {
            Ok(reply) => Ok(reply
                .body()
                .first()
                .and_then(Value::as_str)
                .map(str::to_owned)),
            Err(e) if e.error_name() == Some(bus::ERROR_NAME_HAS_NO_OWNER) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn bus_call(&self, member: &str) -> Message {
        Message::method_call(bus::PATH, member)
            .with_interface(bus::INTERFACE)
            .with_destination(bus::DESTINATION)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.shared();

        f.debug_struct("Connection")
            .field("state", &s.state)
            .field("unique_name", &s.unique_name)
            .finish_non_exhaustive()
    }
}

/// With a retry ahead, the first attempt runs on a copy so the original
/// message survives a disconnect.
fn clone_without_fds(message: &Message) -> Message {
    Message {
        kind: message.kind.clone(),
        serial: message.serial,
        flags: message.flags,
        interface: message.interface.clone(),
        destination: message.destination.clone(),
        sender: message.sender.clone(),
        body: message.body.clone(),
        fds: Vec::new(),
    }
}

fn string_array(reply: &Message) -> Result<Vec<String>> {
    let array = reply
        .body()
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| Error::protocol("reply carried no string array"))?;

    Ok(array
        .items()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect())
}

/// Removes the pending entry when an awaiting caller goes away, so a late
/// reply is dropped silently instead of leaking the slot.
struct PendingCall<'a> {
    inner: &'a Inner,
    serial: u32,
    armed: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.shared().pending.remove(&self.serial);
        }
    }
}
