use std::{
    fmt::Debug,
    io,
    net::{IpAddr, SocketAddr},
};

/// Outcome of a single [`PacketWriter::write_packet`] or [`PacketWriter::flush`] call
#[derive(Debug)]
pub enum WriteResult {
    /// The datagram was accepted; `0` from a batching writer means it is still buffered
    Written(usize),
    /// The writer can't take the datagram right now and did not keep it
    Blocked,
    /// The writer is now blocked but kept the datagram and will send it once writable
    BlockedDataBuffered,
    /// The datagram could not be sent
    Error(io::Error),
}

impl WriteResult {
    /// Whether this result reports backpressure, buffered or not
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedDataBuffered)
    }
}

/// Abstract datagram writer shared with the rest of the endpoint
///
/// Every method takes `&self`: the writer is owned elsewhere and other subsystems may write
/// through it too, so implementations keep any mutable state behind interior mutability.
pub trait PacketWriter: Send + Sync + Debug {
    /// Whether the writer is currently refusing writes
    fn is_write_blocked(&self) -> bool;

    /// Clear the blocked state after the socket signalled writability
    fn set_writable(&self);

    /// Send `contents` to `destination` from the local address `src_ip`
    fn write_packet(&self, contents: &[u8], src_ip: IpAddr, destination: SocketAddr) -> WriteResult;

    /// Whether `write_packet` may buffer datagrams until `flush` is called
    fn is_batch_mode(&self) -> bool {
        false
    }

    /// Send any buffered datagrams
    fn flush(&self) -> WriteResult {
        WriteResult::Written(0)
    }
}
