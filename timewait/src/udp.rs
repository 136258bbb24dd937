use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use proto::{PacketWriter, WriteResult};
use tokio::io::Interest;
use tracing::trace;

/// [`PacketWriter`] sending through a tokio UDP socket
///
/// The socket is shared: the endpoint that owns live connections may keep sending through its
/// own clone of the `Arc`. Each reply leaves from the local address it is addressed from, even
/// when the socket is bound to a wildcard address. Writes never wait; a full send buffer marks
/// the writer blocked until [`set_writable`](PacketWriter::set_writable) is called.
#[derive(Debug)]
pub struct UdpPacketWriter {
    io: Arc<tokio::net::UdpSocket>,
    state: udp::UdpSocketState,
    blocked: AtomicBool,
}

impl UdpPacketWriter {
    /// Wrap `socket`
    ///
    /// Fails if the socket options needed to pick a datagram's source address can't be set.
    pub fn new(socket: Arc<tokio::net::UdpSocket>) -> io::Result<Self> {
        Ok(Self {
            state: udp::UdpSocketState::new((&socket).into())?,
            io: socket,
            blocked: AtomicBool::new(false),
        })
    }

    /// The underlying socket
    pub fn socket(&self) -> &Arc<tokio::net::UdpSocket> {
        &self.io
    }

    /// Poll until the socket can accept another datagram
    pub(crate) fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io.poll_send_ready(cx)
    }
}

impl PacketWriter for UdpPacketWriter {
    fn is_write_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    fn set_writable(&self) {
        self.blocked.store(false, Ordering::Release);
    }

    fn write_packet(&self, contents: &[u8], src_ip: IpAddr, destination: SocketAddr) -> WriteResult {
        trace!(%src_ip, %destination, len = contents.len(), "sending datagram");
        let transmit = udp::Transmit {
            destination,
            ecn: None,
            contents,
            segment_size: None,
            // Let the kernel choose when the caller has no specific address
            src_ip: (!src_ip.is_unspecified()).then_some(src_ip),
        };
        let sent = self.io.try_io(Interest::WRITABLE, || {
            self.state.send((&self.io).into(), &transmit)
        });
        match sent {
            Ok(()) => WriteResult::Written(contents.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.blocked.store(true, Ordering::Release);
                WriteResult::Blocked
            }
            Err(e) => WriteResult::Error(e),
        }
    }
}
