//! Protocol logic for the QUIC time-wait list
//!
//! timewait-proto tracks connection IDs that belong to recently closed connections and decides
//! how to answer packets that keep arriving for them. Like the rest of a sans-I/O protocol stack
//! it performs no I/O of its own and never reads the system clock directly: sockets, timers and
//! the clock are supplied by the caller through the traits in this crate. Most users will want
//! the tokio integration in the `timewait` crate instead.
//!
//! The most important type is [`TimeWaitListManager`]. A dispatcher hands it every connection ID
//! it stops serving via [`TimeWaitListManager::add_connection_id_to_time_wait`], then routes
//! packets for those IDs to [`TimeWaitListManager::process_packet`]. The manager answers each
//! packet with pre-built termination packets, a stateless reset or nothing at all, backs off
//! exponentially per connection ID, queues replies while the writer is blocked, and forgets
//! connection IDs once they have been retained for the configured period.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::too_many_arguments)]

use std::{fmt, net::SocketAddr};

use bytes::Bytes;

mod alarm;
pub use crate::alarm::{Alarm, AlarmFactory};

mod clock;
pub use crate::clock::{Clock, StdClock};

mod config;
pub use crate::config::{ConfigError, TimeWaitConfig};

mod constant_time;

pub mod crypto;

pub mod packet;
pub use crate::packet::{DefaultPacketBuilder, PacketBuilder, PacketFormat};

mod shared;
pub use crate::shared::ConnectionId;

mod time_wait;
pub use crate::time_wait::{
    should_send_response, PerPacketContext, TimeWaitAction, TimeWaitListManager, TimeWaitStats,
    Visitor,
};

mod token;
pub use crate::token::ResetToken;

mod writer;
pub use crate::writer::{PacketWriter, WriteResult};

#[cfg(all(test, feature = "ring"))]
mod tests;

pub use std::time::{Duration, Instant};

/// A reply that has been built but not necessarily written yet
///
/// Owned by the retry queue while the writer is blocked.
#[derive(Clone)]
pub struct QueuedPacket {
    /// The local address the reply is sent from
    pub self_address: SocketAddr,
    /// The address of the peer that elicited the reply
    pub peer_address: SocketAddr,
    /// Contents of the datagram
    pub packet: Bytes,
}

impl QueuedPacket {
    /// Bundle a reply with the addresses it travels between
    pub fn new(self_address: SocketAddr, peer_address: SocketAddr, packet: Bytes) -> Self {
        Self {
            self_address,
            peer_address,
            packet,
        }
    }
}

impl fmt::Debug for QueuedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedPacket")
            .field("self_address", &self.self_address)
            .field("peer_address", &self.peer_address)
            .field("len", &self.packet.len())
            .finish()
    }
}

//
// Useful internal constants
//

/// The maximum number of bytes a connection ID may occupy
pub const MAX_CID_SIZE: usize = 20;
/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;
