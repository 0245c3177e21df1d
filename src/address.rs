//! Parsing of D-Bus server address strings.
//!
//! An address is a semicolon separated list of entries of the form
//! `transport:key=value,key=value`. The entries are tried in order by the
//! connector and the first one that succeeds wins.

use std::env;

use crate::error::{Error, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Preferred address family for a TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// The transport of a single address entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// A unix stream socket bound to a filesystem path.
    Unix { path: String },
    /// A unix stream socket in the Linux abstract namespace.
    UnixAbstract { name: String },
    /// A TCP connection.
    Tcp {
        host: String,
        port: u16,
        family: Option<Family>,
    },
}

/// One parsed entry of a bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub(crate) kind: TransportKind,
    pub(crate) guid: Option<String>,
}

impl Address {
    /// The transport of this entry.
    pub fn kind(&self) -> &TransportKind {
        &self.kind
    }

    /// The server GUID advertised for this entry, if any.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }
}

/// The address of the session bus, from `DBUS_SESSION_BUS_ADDRESS`.
pub fn session_bus_address() -> Result<Vec<Address>> {
    match env::var(ENV_SESSION_BUS) {
        Ok(value) => parse_addresses(&value),
        Err(..) => Err(Error::address("DBUS_SESSION_BUS_ADDRESS is not set")),
    }
}

/// The address of the system bus, from `DBUS_SYSTEM_BUS_ADDRESS` with a
/// fallback to the well-known location.
pub fn system_bus_address() -> Result<Vec<Address>> {
    match env::var(ENV_SYSTEM_BUS) {
        Ok(value) => parse_addresses(&value),
        Err(..) => parse_addresses(DEFAULT_SYSTEM_BUS),
    }
}

/// Parse a bus address string into its entries.
///
/// Entries with an unknown transport are skipped rather than being an error,
/// but an address yielding no usable entry at all is one.
pub fn parse_addresses(string: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();

    for entry in string.split(';') {
        if entry.is_empty() {
            continue;
        }

        if let Some(address) = parse_entry(entry)? {
            out.push(address);
        }
    }

    if out.is_empty() {
        return Err(Error::address("no usable address entry"));
    }

    Ok(out)
}

fn parse_entry(entry: &str) -> Result<Option<Address>> {
    let Some((transport, options)) = entry.split_once(':') else {
        return Err(Error::address("missing transport separator"));
    };

    let mut path = None;
    let mut abstract_name = None;
    let mut host = None;
    let mut port = None;
    let mut family = None;
    let mut guid = None;

    for option in options.split(',') {
        if option.is_empty() {
            continue;
        }

        let Some((key, value)) = option.split_once('=') else {
            return Err(Error::address("malformed key-value pair"));
        };

        let value = unescape(value)?;

        match key {
            "guid" => guid = Some(value),
            "path" if transport == "unix" => path = Some(value),
            "abstract" if transport == "unix" => abstract_name = Some(value),
            "host" if transport == "tcp" => host = Some(value),
            "port" if transport == "tcp" => {
                let Ok(value) = value.parse::<u16>() else {
                    return Err(Error::address("invalid port"));
                };

                port = Some(value);
            }
            "family" if transport == "tcp" => {
                family = Some(match value.as_str() {
                    "ipv4" => Family::Ipv4,
                    "ipv6" => Family::Ipv6,
                    _ => return Err(Error::address("invalid family")),
                });
            }
            _ => {
                // Unknown keys are tolerated the same way unknown
                // transports are.
            }
        }
    }

    let kind = match transport {
        "unix" => match (path, abstract_name) {
            (Some(..), Some(..)) => {
                return Err(Error::address("both path and abstract specified"));
            }
            (Some(path), None) => TransportKind::Unix { path },
            (None, Some(name)) => TransportKind::UnixAbstract { name },
            (None, None) => return Err(Error::address("unix entry without a path")),
        },
        "tcp" => {
            let Some(host) = host else {
                return Err(Error::address("tcp entry without a host"));
            };

            let Some(port) = port else {
                return Err(Error::address("tcp entry without a port"));
            };

            TransportKind::Tcp { host, port, family }
        }
        _ => return Ok(None),
    };

    Ok(Some(Address { kind, guid }))
}

/// Decode `%XX` escapes in an address value.
fn unescape(value: &str) -> Result<String> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }

        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            return Err(Error::address("truncated escape sequence"));
        };

        let (Some(hi), Some(lo)) = (hex_value(hi), hex_value(lo)) else {
            return Err(Error::address("invalid escape sequence"));
        };

        out.push(hi << 4 | lo);
    }

    String::from_utf8(out).map_err(|_| Error::address("escape sequence is not UTF-8"))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
