//! Stream transports carrying the D-Bus protocol.

use std::io::{self, Read, Write};
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::ptr;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::address::{Address, Family, TransportKind};
use crate::error::{Error, Result};

/// A connected stream transport.
///
/// Sockets are kept in nonblocking mode and driven through [`AsyncFd`]
/// readiness, which keeps ancillary-data I/O available on the Unix variant.
pub(crate) struct Transport {
    inner: Inner,
}

enum Inner {
    Unix(AsyncFd<UnixStream>),
    Tcp(AsyncFd<TcpStream>),
}

impl Transport {
    /// Connect a transport for a single address entry.
    pub(crate) async fn connect(address: &Address) -> Result<Self> {
        let inner = match &address.kind {
            TransportKind::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Inner::Unix(AsyncFd::new(stream.into_std()?)?)
            }
            TransportKind::UnixAbstract { name } => {
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                let stream = UnixStream::connect_addr(&addr)?;
                stream.set_nonblocking(true)?;
                Inner::Unix(AsyncFd::new(stream)?)
            }
            TransportKind::Tcp { host, port, family } => {
                let mut stream = None;
                let mut last = None;

                for addr in tokio::net::lookup_host((host.as_str(), *port)).await? {
                    let matches = match family {
                        Some(Family::Ipv4) => addr.is_ipv4(),
                        Some(Family::Ipv6) => addr.is_ipv6(),
                        None => true,
                    };

                    if !matches {
                        continue;
                    }

                    match tokio::net::TcpStream::connect(addr).await {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last = Some(e),
                    }
                }

                let Some(stream) = stream else {
                    return Err(match last {
                        Some(e) => e.into(),
                        None => Error::connect("host resolved to no usable address"),
                    });
                };

                Inner::Tcp(AsyncFd::new(stream.into_std()?)?)
            }
        };

        Ok(Self { inner })
    }

    /// Whether this transport can carry file descriptors.
    pub(crate) fn supports_fd_passing(&self) -> bool {
        matches!(self.inner, Inner::Unix(..))
    }

    /// Clone the transport, sharing the underlying socket. Used to split a
    /// connection into an independently owned read and write half.
    pub(crate) fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            Inner::Unix(fd) => Inner::Unix(AsyncFd::new(fd.get_ref().try_clone()?)?),
            Inner::Tcp(fd) => Inner::Tcp(AsyncFd::new(fd.get_ref().try_clone()?)?),
        };

        Ok(Self { inner })
    }

    /// Send all of `buf`.
    pub(crate) async fn send(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = match &self.inner {
                Inner::Unix(fd) => {
                    fd.async_io(Interest::WRITABLE, |s| (&*s).write(buf)).await?
                }
                Inner::Tcp(fd) => fd.async_io(Interest::WRITABLE, |s| (&*s).write(buf)).await?,
            };

            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }

            buf = &buf[n..];
        }

        Ok(())
    }

    /// Send all of `buf` with `fds` attached to the first byte.
    pub(crate) async fn send_with_fds(&self, buf: &[u8], fds: &[RawFd]) -> Result<()> {
        if fds.is_empty() {
            return self.send(buf).await;
        }

        let Inner::Unix(fd) = &self.inner else {
            return Err(Error::invalid_operation(
                "file descriptor passing is not supported over tcp",
            ));
        };

        let n = fd
            .async_io(Interest::WRITABLE, |s| sendmsg(s.as_raw_fd(), buf, fds))
            .await?;

        self.send(&buf[n..]).await
    }

    /// Receive into `buf`, appending any descriptors that arrived alongside
    /// the bytes. Returns zero at end of stream.
    pub(crate) async fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
        match &self.inner {
            Inner::Unix(fd) => {
                let (n, mut received) = fd
                    .async_io(Interest::READABLE, |s| recvmsg(s.as_raw_fd(), buf))
                    .await?;

                fds.append(&mut received);
                Ok(n)
            }
            Inner::Tcp(fd) => Ok(fd.async_io(Interest::READABLE, |s| (&*s).read(buf)).await?),
        }
    }
}

/// Try the address entries in order and connect the first one that works.
pub(crate) async fn connect_any(addresses: &[Address]) -> Result<(Transport, Address)> {
    let mut last = None;

    for address in addresses {
        match Transport::connect(address).await {
            Ok(transport) => return Ok((transport, address.clone())),
            Err(e) => last = Some(e),
        }
    }

    Err(match last {
        Some(e) => Error::connect(format!("no reachable address entry: {e}")),
        None => Error::connect("empty address list"),
    })
}

fn sendmsg(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    // SAFETY: All pointers handed to sendmsg outlive the call and the
    // control buffer is sized with the CMSG macros.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let space = libc::CMSG_SPACE(mem::size_of_val(fds) as u32) as usize;
        // Control buffers must be aligned like cmsghdr.
        let mut control = vec![0u64; space.div_ceil(8)];

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of_val(fds) as u32) as _;
        ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), fds.len());

        let n = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }
}

fn recvmsg(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    // Room for a generous number of descriptors per read, aligned like
    // cmsghdr.
    const CONTROL_LEN: usize = 256;

    // SAFETY: All pointers handed to recvmsg outlive the call, and received
    // descriptors are immediately wrapped in OwnedFd.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };

        let mut control = [0u64; CONTROL_LEN / 8];

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = CONTROL_LEN as _;

        let n = libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC);

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);

        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();

                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok((n as usize, fds))
    }
}
