//! Raw ICMP sockets, one per monitored interface
//!
//! The engine talks to sockets through [`ProbeSocket`] so it can be driven by
//! test doubles; [`RawIcmpSocket`] is the real non-blocking `SOCK_RAW`
//! implementation.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};

/// Socket operations the probe engine needs
pub trait ProbeSocket {
    /// Send an ICMP message to `target`
    fn send_to(&self, buf: &[u8], target: Ipv4Addr) -> io::Result<usize>;

    /// Receive one datagram; `WouldBlock` when the queue is empty
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)>;

    /// Restrict the socket to a device (`SO_BINDTODEVICE`)
    fn bind_device(&self, name: &str) -> io::Result<()>;

    /// File descriptor registered with the reactor, if any
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Opens the socket of a newly created interface
pub trait SocketFactory {
    fn open(&mut self) -> io::Result<Box<dyn ProbeSocket>>;
}

/// Non-blocking raw IPv4 ICMP socket
#[derive(Debug)]
pub struct RawIcmpSocket {
    socket: Socket,
}

impl RawIcmpSocket {
    /// Create the socket; requires CAP_NET_RAW
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl ProbeSocket for RawIcmpSocket {
    fn send_to(&self, buf: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = SocketAddrV4::new(target, 0);
        self.socket.send_to(buf, &SockAddr::from(addr))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        let mut recv_buf = [MaybeUninit::<u8>::uninit(); 2048];
        let (n, addr) = self.socket.recv_from(&mut recv_buf)?;

        // SAFETY: recv_from initialized the first n bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(recv_buf.as_ptr() as *const u8, n) };
        let len = n.min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);

        let source = addr
            .as_socket_ipv4()
            .map(|a| *a.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok((len, source))
    }

    #[cfg(target_os = "linux")]
    fn bind_device(&self, name: &str) -> io::Result<()> {
        self.socket.bind_device(Some(name.as_bytes()))
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_device(&self, _name: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_BINDTODEVICE is only available on Linux",
        ))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }
}

/// Factory for real raw sockets
#[derive(Debug, Default)]
pub struct RawSocketFactory;

impl SocketFactory for RawSocketFactory {
    fn open(&mut self) -> io::Result<Box<dyn ProbeSocket>> {
        Ok(Box::new(RawIcmpSocket::new()?))
    }
}
