//! Datagram transport seam.
//!
//! The transfer loops only need "send bytes to a peer" and "wait up to a
//! deadline for the next datagram". [`Transport`] captures that so tests can
//! drive the loops over an in-memory link.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

/// Default socket buffer size (4 MB).
pub const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Send attempts on ENOBUFS / WouldBlock before giving up.
const SEND_RETRIES: u32 = 50;

/// Shortest wait handed to the socket. A zero read timeout is an error.
const MIN_WAIT: Duration = Duration::from_millis(1);

pub trait Transport {
    /// Send one datagram.
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Wait up to `timeout` for a datagram. `Ok(None)` means nothing arrived.
    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;
}

impl Transport for UdpSocket {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        // Retry on ENOBUFS / WSAENOBUFS (OS error 10055 on Windows)
        // which means the send buffer is full. Back off briefly and retry.
        let mut retries = 0;
        loop {
            match UdpSocket::send_to(self, data, target) {
                Ok(_) => return Ok(()),
                Err(ref e) if retries < SEND_RETRIES && is_backpressure(e) => {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        self.set_read_timeout(Some(timeout.max(MIN_WAIT)))?;
        match self.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(e) if is_quiet(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_backpressure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(10055) // WSAENOBUFS
        || e.raw_os_error() == Some(105) // ENOBUFS (Linux)
}

/// Errors that only mean "no datagram this time".
fn is_quiet(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            // Windows reports ICMP port unreachable from an earlier send here.
            | io::ErrorKind::ConnectionReset
    )
}

/// Create a blocking UDP socket bound to `addr` with enlarged buffers.
pub fn bind_udp(addr: SocketAddr, buffer_size: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("failed to set UDP recv buffer to {}: {}", buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!("failed to set UDP send buffer to {}: {}", buffer_size, e);
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
