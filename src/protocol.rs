//! Low level constants and framing details of the D-Bus wire protocol.

use crate::error::{Error, ErrorKind};

/// Maximum size of a single message, including header and body.
pub(crate) const MAX_MESSAGE_LENGTH: u32 = 128 * 1024 * 1024;

/// Maximum size of a single marshalled array, which also bounds the header
/// field array.
pub(crate) const MAX_ARRAY_LENGTH: u32 = 64 * 1024 * 1024;

/// The only protocol major version this implementation speaks.
pub(crate) const VERSION: u8 = 1;

/// Size of the fixed part of the header, up to and including the header field
/// array length.
pub(crate) const FIXED_HEADER_LENGTH: usize = 16;

raw_enum! {
    /// The endianness of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian, marker byte `l`.
        LITTLE = b'l',
        /// Big endian, marker byte `B`.
        BIG = b'B',
    }
}

impl Endianness {
    #[cfg(target_endian = "little")]
    pub(crate) const NATIVE: Self = Self::LITTLE;
    #[cfg(target_endian = "big")]
    pub(crate) const NATIVE: Self = Self::BIG;
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub(crate) enum MessageType {
        /// Method call, may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    /// Flags of a D-Bus message.
    #[repr(u8)]
    pub enum Flags {
        /// The empty set of flags.
        EMPTY = 0,
        /// The sender does not expect a method return or error reply and the
        /// receiver should omit it.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not launch an owner for the destination name in
        /// response to this message.
        NO_AUTO_START = 2,
        /// The caller is prepared to wait for interactive authorization on
        /// the receiving side.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

raw_enum! {
    /// Header field codes.
    #[repr(u8)]
    pub(crate) enum FieldCode {
        /// The object path a call is sent to, or a signal is emitted from.
        PATH = 1,
        /// The interface to invoke a method call on, or that a signal is
        /// emitted from.
        INTERFACE = 2,
        /// The member name of a method call or signal.
        MEMBER = 3,
        /// The name of the error that occurred, for errors.
        ERROR_NAME = 4,
        /// The serial of the message this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection the message is intended for.
        DESTINATION = 6,
        /// The unique name of the sending connection, set by the bus.
        SENDER = 7,
        /// The signature of the message body.
        SIGNATURE = 8,
        /// The number of file descriptors accompanying the message.
        UNIX_FDS = 9,
    }
}

/// The fixed part of a message header, excluding the header field array.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) endianness: Endianness,
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) version: u8,
    pub(crate) body_length: u32,
    pub(crate) serial: u32,
}

impl Header {
    /// Decode the first [`FIXED_HEADER_LENGTH`] bytes of a message, returning
    /// the fixed header and the length of the header field array.
    pub(crate) fn from_bytes(bytes: &[u8; FIXED_HEADER_LENGTH]) -> Result<(Self, u32), Error> {
        let endianness = match Endianness(bytes[0]) {
            e @ (Endianness::LITTLE | Endianness::BIG) => e,
            _ => return Err(Error::protocol("invalid endianness marker")),
        };

        let message_type = match MessageType(bytes[1]) {
            t @ (MessageType::METHOD_CALL
            | MessageType::METHOD_RETURN
            | MessageType::ERROR
            | MessageType::SIGNAL) => t,
            _ => return Err(Error::protocol("invalid message type")),
        };

        if bytes[3] != VERSION {
            return Err(Error::protocol("unsupported protocol version"));
        }

        let u32_at = |at: usize| -> u32 {
            let raw = u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

            if endianness == Endianness::NATIVE {
                raw
            } else {
                raw.swap_bytes()
            }
        };

        let header = Self {
            endianness,
            message_type,
            flags: Flags(bytes[2]),
            version: bytes[3],
            body_length: u32_at(4),
            serial: u32_at(8),
        };

        if header.serial == 0 {
            return Err(Error::new(ErrorKind::ZeroSerial));
        }

        Ok((header, u32_at(12)))
    }
}
