//! An in-process bus daemon fixture.
//!
//! Listens on a unix socket in a temporary directory, speaks the server
//! side of the SASL handshake and implements the slice of
//! `org.freedesktop.DBus` the integration tests exercise: Hello, name
//! ownership with queueing and replacement, match rule bookkeeping and
//! message routing.

// Not every test binary uses the whole surface.
#![allow(dead_code)]

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;

use minibus::org_freedesktop_dbus as bus;
use minibus::wire;
use minibus::{Array, Endianness, Message, MessageKind, ObjectPath, Signature, Value};

const ALLOW_REPLACEMENT: u32 = 1;
const REPLACE_EXISTING: u32 = 2;
const DO_NOT_QUEUE: u32 = 4;

const GUID: &str = "6d6f636b627573000000000000000001";

pub struct MockBus {
    address: String,
    state: Arc<Mutex<BusState>>,
    _dir: tempfile::TempDir,
}

#[derive(Default)]
struct BusState {
    next_client: u32,
    serial: u32,
    clients: HashMap<String, UnboundedSender<Vec<u8>>>,
    names: HashMap<String, Vec<QueueEntry>>,
    rules: HashMap<String, Vec<String>>,
    add_match_count: usize,
    remove_match_count: usize,
}

#[derive(Clone)]
struct QueueEntry {
    owner: String,
    flags: u32,
}

impl MockBus {
    pub async fn spawn() -> MockBus {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bus");
        let listener = UnixListener::bind(&path).expect("bind mock bus");
        let address = format!("unix:path={},guid={}", path.display(), GUID);
        let state = Arc::new(Mutex::new(BusState::default()));

        let accept_state = state.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(accept_state.clone(), stream));
            }
        });

        MockBus {
            address,
            state,
            _dir: dir,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn add_match_count(&self) -> usize {
        self.state.lock().await.add_match_count
    }

    pub async fn remove_match_count(&self) -> usize {
        self.state.lock().await.remove_match_count
    }
}

async fn serve_client(state: Arc<Mutex<BusState>>, mut stream: UnixStream) {
    let Ok(leftover) = server_sasl(&mut stream).await else {
        return;
    };

    let (mut read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let unique = {
        let mut s = state.lock().await;
        s.next_client += 1;
        let unique = format!(":1.{}", s.next_client);
        s.clients.insert(unique.clone(), tx);
        unique
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = client_loop(&state, &unique, &mut read, leftover).await;
    drop(result);

    // Drop every name the client owned or was queued for.
    let mut events = Vec::new();

    {
        let mut s = state.lock().await;
        s.clients.remove(&unique);
        s.rules.remove(&unique);

        let names: Vec<String> = s.names.keys().cloned().collect();

        for name in names {
            release(&mut s, &name, &unique, &mut events);
        }
    }

    deliver(&state, events).await;
    writer.abort();
}

/// The server side of the SASL exchange. Returns bytes read past `BEGIN`.
async fn server_sasl(stream: &mut UnixStream) -> Result<Vec<u8>, ()> {
    let mut buf = Vec::new();
    let mut nul_seen = false;

    loop {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await.map_err(drop)?;

        if n == 0 {
            return Err(());
        }

        buf.extend_from_slice(&chunk[..n]);

        if !nul_seen {
            if buf.first() != Some(&0) {
                return Err(());
            }

            buf.remove(0);
            nul_seen = true;
        }

        while let Some(at) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=at).collect();
            let line = std::str::from_utf8(&line).map_err(drop)?.trim_end().to_owned();

            if line.starts_with("AUTH") {
                send_line(stream, &format!("OK {GUID}")).await?;
            } else if line == "NEGOTIATE_UNIX_FD" {
                send_line(stream, "AGREE_UNIX_FD").await?;
            } else if line == "BEGIN" {
                return Ok(buf);
            } else {
                send_line(stream, "ERROR \"unknown command\"").await?;
            }
        }
    }
}

async fn send_line(stream: &mut UnixStream, line: &str) -> Result<(), ()> {
    stream
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(drop)
}

async fn client_loop(
    state: &Arc<Mutex<BusState>>,
    unique: &str,
    read: &mut OwnedReadHalf,
    leftover: Vec<u8>,
) -> Result<(), ()> {
    let mut buf = leftover;

    loop {
        while buf.len() < 16 {
            if fill(read, &mut buf).await? == 0 {
                return Ok(());
            }
        }

        let fixed: &[u8; 16] = buf[..16].try_into().map_err(drop)?;
        let total = wire::frame_size(fixed).map_err(drop)?;

        while buf.len() < total {
            if fill(read, &mut buf).await? == 0 {
                return Ok(());
            }
        }

        let frame: Vec<u8> = buf.drain(..total).collect();
        let message = wire::decode_message(&frame, &mut Vec::new()).map_err(drop)?;

        handle_message(state, unique, message).await?;
    }
}

async fn fill(read: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Result<usize, ()> {
    let mut chunk = [0u8; 4096];
    let n = read.read(&mut chunk).await.map_err(drop)?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

async fn handle_message(
    state: &Arc<Mutex<BusState>>,
    unique: &str,
    message: Message,
) -> Result<(), ()> {
    match message.destination() {
        Some(bus::DESTINATION) => bus_method(state, unique, message).await,
        Some(..) => {
            route(state, unique, message).await;
            Ok(())
        }
        None => {
            if matches!(message.kind(), MessageKind::Signal { .. }) {
                broadcast(state, unique, message).await;
            }

            Ok(())
        }
    }
}

/// Forward a message to its destination, filling in the sender.
async fn route(state: &Arc<Mutex<BusState>>, sender: &str, message: Message) {
    let serial = message.serial();
    let expects_reply = message.expects_reply();
    let message = message.with_sender(sender);

    let (target, error) = {
        let s = state.lock().await;

        let owner = if message.destination().map(|d| d.starts_with(':')) == Some(true) {
            message.destination().map(str::to_owned)
        } else {
            message
                .destination()
                .and_then(|d| s.names.get(d))
                .and_then(|queue| queue.first())
                .map(|entry| entry.owner.clone())
        };

        match owner.and_then(|o| s.clients.get(&o).cloned()) {
            Some(tx) => (Some(tx), false),
            None => (None, expects_reply),
        }
    };

    match target {
        Some(tx) => send_message(state, &tx, message).await,
        None => {
            if error {
                if let (Some(serial), Some(tx)) = (serial, client_tx(state, sender).await) {
                    let reply = Message::error("org.freedesktop.DBus.Error.ServiceUnknown", serial)
                        .with_arg("no such destination")
                        .with_destination(sender)
                        .with_sender(bus::DESTINATION);

                    send_message(state, &tx, reply).await;
                }
            }
        }
    }
}

async fn broadcast(state: &Arc<Mutex<BusState>>, sender: &str, message: Message) {
    let message = message.with_sender(sender);

    let targets: Vec<UnboundedSender<Vec<u8>>> = {
        let s = state.lock().await;

        s.rules
            .iter()
            .filter(|(_, rules)| rules.iter().any(|rule| rule_matches(rule, &message)))
            .filter_map(|(client, _)| s.clients.get(client).cloned())
            .collect()
    };

    for tx in targets {
        send_message_clone(state, &tx, &message).await;
    }
}

async fn bus_method(
    state: &Arc<Mutex<BusState>>,
    unique: &str,
    message: Message,
) -> Result<(), ()> {
    let MessageKind::MethodCall { member, .. } = message.kind() else {
        return Ok(());
    };

    let member = member.clone();
    let serial = message.serial();
    let expects_reply = message.expects_reply();
    let args = message.into_body();

    // Swallowed without a reply, to exercise timeouts and disposal with
    // calls in flight.
    if member == "BlackHole" {
        return Ok(());
    }

    // Test hook: drop the connection.
    if member == "Kick" {
        return Err(());
    }

    let mut events = Vec::new();
    let arg_str = |at: usize| args.get(at).and_then(Value::as_str).map(str::to_owned);

    let reply_body: Result<Vec<Value>, (String, String)> = {
        let mut s = state.lock().await;

        match member.as_str() {
            "Hello" => Ok(vec![Value::from(unique)]),
            "RequestName" => {
                let name = arg_str(0).ok_or(())?;
                let flags = args.get(1).and_then(Value::as_u32).ok_or(())?;
                let code = request_name(&mut s, &name, unique, flags, &mut events);
                Ok(vec![Value::Uint32(code)])
            }
            "ReleaseName" => {
                let name = arg_str(0).ok_or(())?;
                let code = release(&mut s, &name, unique, &mut events);
                Ok(vec![Value::Uint32(code)])
            }
            "GetNameOwner" => {
                let name = arg_str(0).ok_or(())?;

                let owner = if name.starts_with(':') {
                    s.clients.contains_key(&name).then(|| name.clone())
                } else {
                    s.names
                        .get(&name)
                        .and_then(|queue| queue.first())
                        .map(|entry| entry.owner.clone())
                };

                match owner {
                    Some(owner) => Ok(vec![Value::from(owner)]),
                    None => Err((
                        bus::ERROR_NAME_HAS_NO_OWNER.to_owned(),
                        format!("name {name} has no owner"),
                    )),
                }
            }
            "NameHasOwner" => {
                let name = arg_str(0).ok_or(())?;
                let owned = s
                    .names
                    .get(&name)
                    .map(|queue| !queue.is_empty())
                    .unwrap_or(false);
                Ok(vec![Value::Bool(owned)])
            }
            "ListNames" => {
                let mut names: Vec<String> = s.clients.keys().cloned().collect();
                names.push(bus::DESTINATION.to_owned());
                names.extend(
                    s.names
                        .iter()
                        .filter(|(_, queue)| !queue.is_empty())
                        .map(|(name, _)| name.clone()),
                );
                Ok(vec![Value::Array(Array::of_strings(names))])
            }
            "ListActivatableNames" => Ok(vec![Value::Array(Array::new(Signature::STRING))]),
            "StartServiceByName" => Err((
                "org.freedesktop.DBus.Error.ServiceUnknown".to_owned(),
                "activation is not supported".to_owned(),
            )),
            "AddMatch" => {
                let rule = arg_str(0).ok_or(())?;
                s.add_match_count += 1;
                s.rules.entry(unique.to_owned()).or_default().push(rule);
                Ok(vec![])
            }
            "RemoveMatch" => {
                let rule = arg_str(0).ok_or(())?;
                s.remove_match_count += 1;

                if let Some(rules) = s.rules.get_mut(unique) {
                    if let Some(at) = rules.iter().position(|r| *r == rule) {
                        rules.remove(at);
                    }
                }

                Ok(vec![])
            }
            _ => Err((
                "org.freedesktop.DBus.Error.UnknownMethod".to_owned(),
                format!("unknown bus method {member}"),
            )),
        }
    };

    // Signals go out before the reply, the way the real daemon orders them.
    deliver(state, events).await;

    if !expects_reply {
        return Ok(());
    }

    let Some(serial) = serial else {
        return Ok(());
    };

    let reply = match reply_body {
        Ok(body) => Message::method_return(serial).with_body(body),
        Err((name, text)) => Message::error(&name, serial).with_arg(text),
    };

    let reply = reply.with_destination(unique).with_sender(bus::DESTINATION);

    if let Some(tx) = client_tx(state, unique).await {
        send_message(state, &tx, reply).await;
    }

    Ok(())
}

enum Event {
    /// `NameOwnerChanged` broadcast.
    OwnerChanged {
        name: String,
        old: String,
        new: String,
    },
    /// Directed `NameAcquired` or `NameLost`.
    Directed {
        member: &'static str,
        target: String,
        name: String,
    },
}

fn request_name(
    s: &mut BusState,
    name: &str,
    client: &str,
    flags: u32,
    events: &mut Vec<Event>,
) -> u32 {
    let queue = s.names.entry(name.to_owned()).or_default();

    let Some(owner) = queue.first().cloned() else {
        queue.push(QueueEntry {
            owner: client.to_owned(),
            flags,
        });
        push_acquire_events(events, name, "", client);
        return 1; // PRIMARY_OWNER
    };

    if owner.owner == client {
        return 4; // ALREADY_OWNER
    }

    if owner.flags & ALLOW_REPLACEMENT != 0 && flags & REPLACE_EXISTING != 0 {
        queue.remove(0);

        // The replaced owner re-queues unless it asked not to.
        if owner.flags & DO_NOT_QUEUE == 0 {
            queue.push(owner.clone());
        }

        queue.insert(
            0,
            QueueEntry {
                owner: client.to_owned(),
                flags,
            },
        );

        events.push(Event::Directed {
            member: "NameLost",
            target: owner.owner.clone(),
            name: name.to_owned(),
        });
        push_acquire_events(events, name, &owner.owner, client);
        return 1; // PRIMARY_OWNER
    }

    if flags & DO_NOT_QUEUE != 0 {
        return 3; // EXISTS
    }

    if !queue.iter().any(|entry| entry.owner == client) {
        queue.push(QueueEntry {
            owner: client.to_owned(),
            flags,
        });
    }

    2 // IN_QUEUE
}

fn release(s: &mut BusState, name: &str, client: &str, events: &mut Vec<Event>) -> u32 {
    let Some(queue) = s.names.get_mut(name) else {
        return 2; // NON_EXISTENT
    };

    if queue.is_empty() {
        s.names.remove(name);
        return 2; // NON_EXISTENT
    }

    let Some(at) = queue.iter().position(|entry| entry.owner == client) else {
        return 3; // NOT_OWNER
    };

    queue.remove(at);

    if at == 0 {
        events.push(Event::Directed {
            member: "NameLost",
            target: client.to_owned(),
            name: name.to_owned(),
        });

        match queue.first() {
            Some(successor) => {
                push_acquire_events(events, name, client, &successor.owner.clone());
            }
            None => {
                events.push(Event::OwnerChanged {
                    name: name.to_owned(),
                    old: client.to_owned(),
                    new: String::new(),
                });
                s.names.remove(name);
            }
        }
    }

    1 // RELEASED
}

fn push_acquire_events(events: &mut Vec<Event>, name: &str, old: &str, new: &str) {
    events.push(Event::Directed {
        member: "NameAcquired",
        target: new.to_owned(),
        name: name.to_owned(),
    });
    events.push(Event::OwnerChanged {
        name: name.to_owned(),
        old: old.to_owned(),
        new: new.to_owned(),
    });
}

async fn deliver(state: &Arc<Mutex<BusState>>, events: Vec<Event>) {
    const DBUS_PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");

    for event in events {
        match event {
            Event::OwnerChanged { name, old, new } => {
                let signal = Message::signal(DBUS_PATH, bus::INTERFACE, "NameOwnerChanged")
                    .with_arg(name)
                    .with_arg(old)
                    .with_arg(new);

                broadcast(state, bus::DESTINATION, signal).await;
            }
            Event::Directed {
                member,
                target,
                name,
            } => {
                let signal = Message::signal(DBUS_PATH, bus::INTERFACE, member)
                    .with_destination(target.clone())
                    .with_sender(bus::DESTINATION)
                    .with_arg(name);

                if let Some(tx) = client_tx(state, &target).await {
                    send_message(state, &tx, signal).await;
                }
            }
        }
    }
}

async fn client_tx(
    state: &Arc<Mutex<BusState>>,
    client: &str,
) -> Option<UnboundedSender<Vec<u8>>> {
    state.lock().await.clients.get(client).cloned()
}

async fn send_message(
    state: &Arc<Mutex<BusState>>,
    tx: &UnboundedSender<Vec<u8>>,
    message: Message,
) {
    send_message_clone(state, tx, &message).await;
}

async fn send_message_clone(
    state: &Arc<Mutex<BusState>>,
    tx: &UnboundedSender<Vec<u8>>,
    message: &Message,
) {
    let serial = match message.serial() {
        Some(serial) => serial,
        None => {
            let mut s = state.lock().await;
            s.serial += 1;
            NonZeroU32::new(s.serial).unwrap_or(NonZeroU32::MIN)
        }
    };

    if let Ok(frame) = wire::encode_message(message, serial, Endianness::LITTLE) {
        let _ = tx.send(frame);
    }
}

/// A deliberately small match rule evaluator: `key='value'` pairs over the
/// fields the tests use.
fn rule_matches(rule: &str, message: &Message) -> bool {
    for part in rule.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return false;
        };

        let value = value.trim_matches('\'');

        let ok = match key {
            "type" => value == "signal",
            "sender" => message.sender() == Some(value),
            "interface" => message.interface() == Some(value),
            "member" => message.member() == Some(value),
            "path" => message.path().map(|p| p.as_str()) == Some(value),
            "arg0" => message.body().first().and_then(Value::as_str) == Some(value),
            "arg0namespace" => match message.body().first().and_then(Value::as_str) {
                Some(arg0) => {
                    arg0 == value
                        || (arg0.starts_with(value)
                            && arg0.as_bytes().get(value.len()) == Some(&b'.'))
                }
                None => false,
            },
            _ => true,
        };

        if !ok {
            return false;
        }
    }

    true
}
