//! The message pump: one reader task and one writer task per link.
//!
//! The writer drains a FIFO of encoded frames, which gives wire order for
//! free. The reader decodes inbound frames and routes them to the pending
//! call table, the signal subscriptions or the object registry. A protocol
//! error on the read path is fatal for the link.

use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus as bus;
use crate::protocol::{Flags, FIXED_HEADER_LENGTH};
use crate::transport::Transport;
use crate::wire;

use super::connection::{ConnectionState, Frame, Inner};
use super::registry::MethodReply;
use super::{names, signals};

/// Drain the outbound queue onto the wire, one frame at a time.
pub(crate) async fn write_loop(
    inner: Weak<Inner>,
    transport: Transport,
    mut rx: UnboundedReceiver<Frame>,
    epoch: u64,
) {
    while let Some(frame) = rx.recv().await {
        let fds: Vec<RawFd> = frame.fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let result = if fds.is_empty() {
            transport.send(&frame.bytes).await
        } else {
            transport.send_with_fds(&frame.bytes, &fds).await
        };

        // The frame drops here, closing its descriptors whether or not the
        // send succeeded.

        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                fail(&inner, epoch, e);
            }

            return;
        }
    }
}

/// Read frames off the wire and dispatch them until the link dies.
pub(crate) async fn read_loop(
    inner: Weak<Inner>,
    transport: Transport,
    leftover: Vec<u8>,
    epoch: u64,
) {
    let mut reader = FrameReader::new(transport, leftover);

    loop {
        let message = match reader.next_message().await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "read path failed, closing connection");

                if let Some(inner) = inner.upgrade() {
                    fail(&inner, epoch, e);
                }

                return;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        dispatch(&inner, message);
    }
}

/// Transition the link to disconnected and abort everything waiting on it.
pub(crate) fn fail(inner: &Arc<Inner>, epoch: u64, cause: Error) {
    let (pending, link, names) = {
        let mut s = inner.shared();

        let live = matches!(
            s.state,
            ConnectionState::Connected | ConnectionState::Connecting
        );

        if s.epoch != epoch || !live {
            return;
        }

        s.state = ConnectionState::Disconnected;
        s.last_error = Some(cause.clone());
        s.unique_name = None;

        (
            mem::take(&mut s.pending),
            s.link.take(),
            mem::take(&mut s.names),
        )
    };

    let error = Error::disconnected(Some(cause.clone()));

    for (_, tx) in pending {
        let _ = tx.send(Err(error.clone()));
    }

    if let Some(link) = link {
        link.reader_task.abort();
        link.writer_task.abort();
    }

    // Names die with the link that owned them.
    for (name, state) in names {
        if let Some(on_lost) = state.lost_callback() {
            inner.execute(move || on_lost(&name));
        }
    }

    inner.fire_state_change(ConnectionState::Disconnected, Some(cause));
}

fn dispatch(inner: &Arc<Inner>, message: Message) {
    match &message.kind {
        MessageKind::MethodReturn { reply_serial } | MessageKind::Error { reply_serial, .. } => {
            let serial = reply_serial.get();
            let tx = inner.shared().pending.remove(&serial);

            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(message));
                }
                None => {
                    // Late delivery after a cancel, or a confused peer.
                    tracing::debug!(serial, "dropping reply with no pending call");
                }
            }
        }
        MessageKind::Signal { .. } => {
            if message.interface() == Some(bus::INTERFACE) {
                names::handle_bus_signal(inner, &message);
            }

            signals::dispatch_signal(inner, message);
        }
        MessageKind::MethodCall { .. } => dispatch_call(inner, message),
    }
}

fn dispatch_call(inner: &Arc<Inner>, message: Message) {
    let MessageKind::MethodCall { path, .. } = &message.kind else {
        return;
    };

    let handler = inner.shared().handlers.get(path).cloned();
    let no_reply = message.flags & Flags::NO_REPLY_EXPECTED;
    let inner = inner.clone();

    inner.clone().execute(move || {
        let reply = match &handler {
            Some(handler) => match handler.handle(&message) {
                Some(reply) => reply,
                None => MethodReply::Error {
                    name: bus::ERROR_UNKNOWN_METHOD.into(),
                    message: "method not handled by this object".into(),
                },
            },
            None => MethodReply::Error {
                name: bus::ERROR_UNKNOWN_OBJECT.into(),
                message: "no object registered at this path".into(),
            },
        };

        if no_reply {
            return;
        }

        let Some(serial) = message.serial() else {
            return;
        };

        let out = match reply {
            MethodReply::Return(body) => Message::method_return(serial).with_body(body),
            MethodReply::Error { name, message } => {
                let mut out = Message::error(&name, serial);

                if !message.is_empty() {
                    out = out.with_arg(message);
                }

                out
            }
        };

        let out = match message.sender() {
            Some(sender) => out.with_destination(sender),
            None => out,
        };

        if let Err(e) = inner.send_message(out) {
            tracing::debug!(error = %e, "failed to queue method reply");
        }
    });
}

/// Buffers the stream into whole frames, tracking the descriptors that
/// arrive alongside them.
struct FrameReader {
    transport: Transport,
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl FrameReader {
    fn new(transport: Transport, leftover: Vec<u8>) -> Self {
        Self {
            transport,
            buf: leftover,
            fds: Vec::new(),
        }
    }

    async fn next_message(&mut self) -> Result<Message> {
        self.fill(FIXED_HEADER_LENGTH).await?;

        let fixed: &[u8; FIXED_HEADER_LENGTH] = self.buf[..FIXED_HEADER_LENGTH]
            .try_into()
            .map_err(|_| Error::protocol("truncated message header"))?;

        let total = wire::frame_size(fixed)?;
        self.fill(total).await?;

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        wire::decode_message(&frame, &mut self.fds)
    }

    /// Buffer at least `n` bytes. End of stream is a disconnect.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            let read = self.transport.recv(&mut chunk, &mut self.fds).await?;

            if read == 0 {
                return Err(Error::connect("connection closed by peer"));
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }

        Ok(())
    }
}
