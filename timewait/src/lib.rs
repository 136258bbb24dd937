//! QUIC time-wait list for tokio
//!
//! Once a QUIC server forgets a connection, packets the peer keeps sending for it must still be
//! answered, or the peer will retransmit until its idle timeout. This crate serves the
//! [`TimeWaitListManager`] from timewait-proto on a tokio UDP socket: [`TimeWait`] is the
//! handle a dispatcher uses to hand over closed connection IDs and route packets for them, and
//! [`TimeWaitDriver`] is the future that sweeps expired connection IDs and flushes replies that
//! had to wait for the socket.
//!
//! ```no_run
//! # use std::{net::Ipv4Addr, sync::Arc};
//! # use timewait::{TimeWait, TimeWaitConfig};
//! # async fn run() -> std::io::Result<()> {
//! let socket = Arc::new(tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 4433)).await?);
//! let (time_wait, driver) = TimeWait::new(Arc::new(TimeWaitConfig::default()), socket)?;
//! tokio::spawn(driver);
//! # drop(time_wait);
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod alarm;
mod clock;
mod mutex;
mod time_wait;
mod udp;

pub use proto::{
    crypto, packet, ConfigError, ConnectionId, PacketFormat, PerPacketContext, ResetToken,
    TimeWaitAction, TimeWaitConfig, TimeWaitListManager, TimeWaitStats, Visitor,
};

pub use crate::clock::TokioClock;
pub use crate::time_wait::{TimeWait, TimeWaitDriver};
pub use crate::udp::UdpPacketWriter;
