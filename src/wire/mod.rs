//! Encoding and decoding of D-Bus messages.
//!
//! Marshalling is alignment-directed: every value is padded to the alignment
//! of its type before it is emitted, and the reader mirrors the padding. The
//! header is the fixed twelve bytes followed by a field array of type
//! `a(yv)`; the body follows the header padded to eight bytes and its
//! padding is computed from the body start.

use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPath;
use crate::protocol::{
    Endianness, FieldCode, Header, MessageType, FIXED_HEADER_LENGTH, MAX_ARRAY_LENGTH,
    MAX_MESSAGE_LENGTH, VERSION,
};
use crate::signature::{alignment_of, OwnedSignature, Signature};
use crate::value::{Array, Dict, Value};

#[cfg(test)]
mod tests;

/// Maximum nesting of variants inside a single body.
const MAX_VARIANT_DEPTH: usize = 64;

/// Compute the total size in bytes of a message from its first sixteen
/// bytes, validating the size limits.
///
/// This is what a reader uses to figure out how much more of the stream it
/// has to buffer before [`decode_message`] can run.
pub fn frame_size(fixed: &[u8; FIXED_HEADER_LENGTH]) -> Result<usize> {
    let (header, fields_len) = Header::from_bytes(fixed)?;

    if fields_len > MAX_ARRAY_LENGTH {
        return Err(Error::protocol("header field array too long"));
    }

    let fields_len = fields_len as usize;
    let body_start = FIXED_HEADER_LENGTH + fields_len + padding_to(fields_len, 8);
    let total = body_start as u64 + u64::from(header.body_length);

    if total > u64::from(MAX_MESSAGE_LENGTH) {
        return Err(Error::new(ErrorKind::MessageTooLong(total)));
    }

    Ok(total as usize)
}

/// Encode a message into a single wire frame.
///
/// The serial is assigned by the caller since serials are a per-connection
/// resource. File descriptors attached to the message are referenced by the
/// `UNIX_FDS` header field but travel out of band.
pub fn encode_message(
    message: &Message,
    serial: NonZeroU32,
    endianness: Endianness,
) -> Result<Vec<u8>> {
    let mut body = Writer::new(endianness);

    for value in &message.body {
        body.put_value(value, 0)?;
    }

    let Ok(body_length) = u32::try_from(body.buf.len()) else {
        return Err(Error::new(ErrorKind::MessageTooLong(body.buf.len() as u64)));
    };

    let message_type = match &message.kind {
        MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
        MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
        MessageKind::Error { .. } => MessageType::ERROR,
        MessageKind::Signal { .. } => MessageType::SIGNAL,
    };

    let mut w = Writer::new(endianness);
    w.buf
        .extend_from_slice(&[endianness.0, message_type.0, message.flags.0, VERSION]);
    w.put_u32(body_length);
    w.put_u32(serial.get());

    // Header field array. Its length is patched in once the fields are
    // written; the first element needs no padding since it starts at offset
    // sixteen.
    w.put_u32(0);
    let fields_start = w.buf.len();

    match &message.kind {
        MessageKind::MethodCall { path, member } => {
            w.put_path_field(FieldCode::PATH, path);
            w.put_string_field(FieldCode::MEMBER, member);
        }
        MessageKind::MethodReturn { reply_serial } => {
            w.put_u32_field(FieldCode::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Error {
            error_name,
            reply_serial,
        } => {
            w.put_string_field(FieldCode::ERROR_NAME, error_name);
            w.put_u32_field(FieldCode::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Signal { path, member } => {
            if message.interface.is_none() {
                return Err(Error::invalid_operation("signal requires an interface"));
            }

            w.put_path_field(FieldCode::PATH, path);
            w.put_string_field(FieldCode::MEMBER, member);
        }
    }

    if let Some(interface) = &message.interface {
        w.put_string_field(FieldCode::INTERFACE, interface);
    }

    if let Some(destination) = &message.destination {
        w.put_string_field(FieldCode::DESTINATION, destination);
    }

    if let Some(sender) = &message.sender {
        w.put_string_field(FieldCode::SENDER, sender);
    }

    let signature = message.signature();

    if !signature.is_empty() {
        w.pad(8);
        w.put_u8(FieldCode::SIGNATURE.0);
        w.put_signature(Signature::SIGNATURE);
        w.put_signature(&signature);
    }

    if !message.fds.is_empty() {
        w.put_u32_field(FieldCode::UNIX_FDS, message.fds.len() as u32);
    }

    let fields_len = w.buf.len() - fields_start;

    let Ok(fields_len) = u32::try_from(fields_len) else {
        return Err(Error::protocol("header field array too long"));
    };

    if fields_len > MAX_ARRAY_LENGTH {
        return Err(Error::protocol("header field array too long"));
    }

    w.patch_u32(fields_start - 4, fields_len);
    w.pad(8);

    let total = w.buf.len() as u64 + u64::from(body_length);

    if total > u64::from(MAX_MESSAGE_LENGTH) {
        return Err(Error::new(ErrorKind::MessageTooLong(total)));
    }

    w.buf.extend_from_slice(&body.buf);
    Ok(w.buf)
}

/// Decode a single complete wire frame into a message.
///
/// `frame` must be exactly the number of bytes [`frame_size`] reported.
/// `fds` is the queue of descriptors received so far; the message takes the
/// number its `UNIX_FDS` header field declares off the front.
pub fn decode_message(frame: &[u8], fds: &mut Vec<OwnedFd>) -> Result<Message> {
    let Some(fixed) = frame
        .get(..FIXED_HEADER_LENGTH)
        .and_then(|bytes| <&[u8; FIXED_HEADER_LENGTH]>::try_from(bytes).ok())
    else {
        return Err(Error::protocol("truncated message header"));
    };

    let (header, fields_len) = Header::from_bytes(fixed)?;

    if frame.len() != frame_size(fixed)? {
        return Err(Error::protocol("frame length mismatch"));
    }

    let fields_end = FIXED_HEADER_LENGTH + fields_len as usize;
    let body_start = fields_end + padding_to(fields_end, 8);

    let mut fields = Fields::default();
    let mut r = Reader::new(&frame[..fields_end], header.endianness);
    r.at = FIXED_HEADER_LENGTH;

    while r.at < fields_end {
        r.align(8)?;

        if r.at == fields_end {
            break;
        }

        let code = FieldCode(r.u8()?);
        let signature = r.signature()?;
        fields.decode_field(&mut r, code, &signature)?;
    }

    let body_signature = fields.signature.unwrap_or_else(OwnedSignature::empty);
    let mut body = Vec::new();
    let mut r = Reader::new(&frame[body_start..], header.endianness);

    for ty in body_signature.iter() {
        body.push(r.value(ty, 0)?);
    }

    if r.at != r.buf.len() {
        return Err(Error::protocol("body does not match its signature"));
    }

    let fd_count = fields.unix_fds.unwrap_or(0) as usize;

    if fd_count > fds.len() {
        return Err(Error::protocol("message is missing file descriptors"));
    }

    let fds = fds.drain(..fd_count).collect();

    let reply_serial = |serial: Option<u32>| -> Result<NonZeroU32> {
        let serial = require(serial, "REPLY_SERIAL")?;
        NonZeroU32::new(serial).ok_or(Error::protocol("zero REPLY_SERIAL header"))
    };

    let kind = match header.message_type {
        MessageType::METHOD_CALL => MessageKind::MethodCall {
            path: require(fields.path.take(), "PATH")?,
            member: require(fields.member.take(), "MEMBER")?,
        },
        MessageType::METHOD_RETURN => MessageKind::MethodReturn {
            reply_serial: reply_serial(fields.reply_serial)?,
        },
        MessageType::ERROR => MessageKind::Error {
            reply_serial: reply_serial(fields.reply_serial)?,
            error_name: require(fields.error_name.take(), "ERROR_NAME")?,
        },
        MessageType::SIGNAL => {
            if fields.interface.is_none() {
                return Err(Error::new(ErrorKind::MissingRequiredField("INTERFACE")));
            }

            MessageKind::Signal {
                path: require(fields.path.take(), "PATH")?,
                member: require(fields.member.take(), "MEMBER")?,
            }
        }
        _ => return Err(Error::protocol("invalid message type")),
    };

    Ok(Message {
        kind,
        serial: NonZeroU32::new(header.serial),
        flags: header.flags,
        interface: fields.interface,
        destination: fields.destination,
        sender: fields.sender,
        body,
        fds,
    })
}

/// The padding required to bring `at` up to `align`.
pub(crate) fn padding_to(at: usize, align: usize) -> usize {
    (align - at % align) % align
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T> {
    field.ok_or(Error::new(ErrorKind::MissingRequiredField(name)))
}

#[derive(Default)]
struct Fields {
    path: Option<crate::object_path::OwnedObjectPath>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Option<OwnedSignature>,
    unix_fds: Option<u32>,
}

impl Fields {
    fn decode_field(
        &mut self,
        r: &mut Reader<'_>,
        code: FieldCode,
        signature: &Signature,
    ) -> Result<()> {
        let expect = |expected: &Signature| {
            if signature == expected {
                Ok(())
            } else {
                Err(Error::protocol("header field has unexpected signature"))
            }
        };

        match code {
            FieldCode::PATH => {
                expect(Signature::OBJECT_PATH)?;
                let path = r.string()?;
                self.path = Some(ObjectPath::new(&path)?.to_owned());
            }
            FieldCode::INTERFACE => {
                expect(Signature::STRING)?;
                self.interface = Some(r.string()?);
            }
            FieldCode::MEMBER => {
                expect(Signature::STRING)?;
                self.member = Some(r.string()?);
            }
            FieldCode::ERROR_NAME => {
                expect(Signature::STRING)?;
                self.error_name = Some(r.string()?);
            }
            FieldCode::REPLY_SERIAL => {
                expect(Signature::UINT32)?;
                self.reply_serial = Some(r.u32()?);
            }
            FieldCode::DESTINATION => {
                expect(Signature::STRING)?;
                self.destination = Some(r.string()?);
            }
            FieldCode::SENDER => {
                expect(Signature::STRING)?;
                self.sender = Some(r.string()?);
            }
            FieldCode::SIGNATURE => {
                expect(Signature::SIGNATURE)?;
                self.signature = Some(r.signature()?);
            }
            FieldCode::UNIX_FDS => {
                expect(Signature::UINT32)?;
                self.unix_fds = Some(r.u32()?);
            }
            _ => {
                // Unknown header fields are skipped for forward
                // compatibility.
                r.value(signature, 0)?;
            }
        }

        Ok(())
    }
}

struct Writer {
    buf: Vec<u8>,
    endianness: Endianness,
}

impl Writer {
    fn new(endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
        }
    }

    fn pad(&mut self, align: usize) {
        let padding = padding_to(self.buf.len(), align);
        self.buf.extend(std::iter::repeat(0).take(padding));
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.pad(2);
        self.put_raw(&value.to_le_bytes(), &value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.pad(4);
        self.put_raw(&value.to_le_bytes(), &value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.pad(8);
        self.put_raw(&value.to_le_bytes(), &value.to_be_bytes());
    }

    fn put_raw(&mut self, le: &[u8], be: &[u8]) {
        if self.endianness == Endianness::LITTLE {
            self.buf.extend_from_slice(le);
        } else {
            self.buf.extend_from_slice(be);
        }
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        let bytes = if self.endianness == Endianness::LITTLE {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };

        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    fn put_signature(&mut self, value: &Signature) {
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    fn put_string_field(&mut self, code: FieldCode, value: &str) {
        self.pad(8);
        self.put_u8(code.0);
        self.put_signature(Signature::STRING);
        self.put_string(value);
    }

    fn put_path_field(&mut self, code: FieldCode, value: &ObjectPath) {
        self.pad(8);
        self.put_u8(code.0);
        self.put_signature(Signature::OBJECT_PATH);
        self.put_string(value.as_str());
    }

    fn put_u32_field(&mut self, code: FieldCode, value: u32) {
        self.pad(8);
        self.put_u8(code.0);
        self.put_signature(Signature::UINT32);
        self.put_u32(value);
    }

    fn put_value(&mut self, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Bool(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_u16(*v as u16),
            Value::Uint16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_u32(*v as u32),
            Value::Uint32(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_u64(*v as u64),
            Value::Uint64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_u64(v.to_bits()),
            Value::String(v) => self.put_string(v),
            Value::ObjectPath(v) => self.put_string(v.as_str()),
            Value::Signature(v) => self.put_signature(v),
            Value::UnixFd(v) => self.put_u32(*v),
            Value::Array(array) => self.put_array(array, depth)?,
            Value::Dict(dict) => self.put_dict(dict, depth)?,
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(Error::protocol("struct has no fields"));
                }

                self.pad(8);

                for field in fields {
                    self.put_value(field, depth)?;
                }
            }
            Value::Variant(inner) => {
                if depth >= MAX_VARIANT_DEPTH {
                    return Err(Error::protocol("variant nesting too deep"));
                }

                self.put_signature(&inner.signature());
                self.put_value(inner, depth + 1)?;
            }
        }

        Ok(())
    }

    fn put_array(&mut self, array: &Array, depth: usize) -> Result<()> {
        if array.element.iter().count() != 1 {
            return Err(Error::protocol("array element is not a single type"));
        }

        self.put_u32(0);
        let len_at = self.buf.len() - 4;
        self.pad(alignment_of(array.element.as_bytes()[0]));
        let start = self.buf.len();

        for item in &array.items {
            if *item.signature() != *array.element {
                return Err(Error::protocol("array element does not match signature"));
            }

            self.put_value(item, depth)?;
        }

        self.finish_array(len_at, start)
    }

    fn put_dict(&mut self, dict: &Dict, depth: usize) -> Result<()> {
        if dict.key.len() != 1
            || !crate::signature::is_basic(dict.key.as_bytes()[0])
            || dict.value.iter().count() != 1
        {
            return Err(Error::protocol("invalid dict entry signature"));
        }

        self.put_u32(0);
        let len_at = self.buf.len() - 4;
        self.pad(8);
        let start = self.buf.len();

        for (key, value) in &dict.entries {
            if *key.signature() != *dict.key || *value.signature() != *dict.value {
                return Err(Error::protocol("dict entry does not match signature"));
            }

            self.pad(8);
            self.put_value(key, depth)?;
            self.put_value(value, depth)?;
        }

        self.finish_array(len_at, start)
    }

    fn finish_array(&mut self, len_at: usize, start: usize) -> Result<()> {
        let len = self.buf.len() - start;

        let Ok(len) = u32::try_from(len) else {
            return Err(Error::protocol("array too long"));
        };

        if len > MAX_ARRAY_LENGTH {
            return Err(Error::protocol("array too long"));
        }

        self.patch_u32(len_at, len);
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
    endianness: Endianness,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], endianness: Endianness) -> Self {
        Self {
            buf,
            at: 0,
            endianness,
        }
    }

    fn align(&mut self, align: usize) -> Result<()> {
        let target = self.at + padding_to(self.at, align);

        if target > self.buf.len() {
            return Err(Error::protocol("truncated message"));
        }

        self.at = target;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let Some(end) = self.at.checked_add(n) else {
            return Err(Error::protocol("truncated message"));
        };

        if end > self.buf.len() {
            return Err(Error::protocol("truncated message"));
        }

        let bytes = &self.buf[self.at..end];
        self.at = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap_or_default();

        Ok(if self.endianness == Endianness::LITTLE {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        })
    }

    fn u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();

        Ok(if self.endianness == Endianness::LITTLE {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap_or_default();

        Ok(if self.endianness == Endianness::LITTLE {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;

        if self.u8()? != 0 {
            return Err(Error::protocol("string is not nul terminated"));
        }

        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    fn signature(&mut self) -> Result<OwnedSignature> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;

        if self.u8()? != 0 {
            return Err(Error::protocol("signature is not nul terminated"));
        }

        Ok(Signature::new(bytes)?.to_owned())
    }

    fn value(&mut self, signature: &Signature, depth: usize) -> Result<Value> {
        let bytes = signature.as_bytes();

        Ok(match bytes[0] {
            b'y' => Value::Byte(self.u8()?),
            b'b' => match self.u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(Error::protocol("invalid boolean value")),
            },
            b'n' => Value::Int16(self.u16()? as i16),
            b'q' => Value::Uint16(self.u16()?),
            b'i' => Value::Int32(self.u32()? as i32),
            b'u' => Value::Uint32(self.u32()?),
            b'x' => Value::Int64(self.u64()? as i64),
            b't' => Value::Uint64(self.u64()?),
            b'd' => Value::Double(f64::from_bits(self.u64()?)),
            b's' => Value::String(self.string()?),
            b'o' => {
                let path = self.string()?;
                Value::ObjectPath(ObjectPath::new(&path)?.to_owned())
            }
            b'g' => Value::Signature(self.signature()?),
            b'h' => Value::UnixFd(self.u32()?),
            b'v' => {
                if depth >= MAX_VARIANT_DEPTH {
                    return Err(Error::protocol("variant nesting too deep"));
                }

                let inner = self.signature()?;

                if inner.iter().count() != 1 {
                    return Err(Error::protocol("variant signature is not a single type"));
                }

                Value::Variant(Box::new(self.value(&inner, depth + 1)?))
            }
            b'a' => {
                let len = self.u32()?;

                if len > MAX_ARRAY_LENGTH {
                    return Err(Error::protocol("array too long"));
                }

                // SAFETY: A subslice of a complete array type is a valid
                // signature.
                let element = unsafe { Signature::new_unchecked(&bytes[1..]) };
                self.align(alignment_of(element.as_bytes()[0]))?;
                let end = self.at + len as usize;

                if end > self.buf.len() {
                    return Err(Error::protocol("truncated message"));
                }

                if element.as_bytes()[0] == b'{' {
                    let entry = &element.as_bytes()[1..element.len() - 1];
                    // SAFETY: The key is a single basic type code and the
                    // value is the complete type following it.
                    let key = unsafe { Signature::new_unchecked(&entry[..1]) };
                    let value = unsafe { Signature::new_unchecked(&entry[1..]) };
                    let mut dict = Dict::new(key, value);

                    while self.at < end {
                        self.align(8)?;
                        let k = self.value(key, depth)?;
                        let v = self.value(value, depth)?;
                        dict.insert(k, v);
                    }

                    if self.at != end {
                        return Err(Error::protocol("array length mismatch"));
                    }

                    Value::Dict(dict)
                } else {
                    let mut array = Array::new(element);

                    while self.at < end {
                        array.push(self.value(element, depth)?);
                    }

                    if self.at != end {
                        return Err(Error::protocol("array length mismatch"));
                    }

                    Value::Array(array)
                }
            }
            b'(' => {
                self.align(8)?;
                // SAFETY: The fields of a complete struct type are a valid
                // signature.
                let fields = unsafe { Signature::new_unchecked(&bytes[1..bytes.len() - 1]) };
                let mut values = Vec::new();

                for field in fields.iter() {
                    values.push(self.value(field, depth)?);
                }

                Value::Struct(values)
            }
            _ => return Err(Error::protocol("unsupported type code")),
        })
    }
}
