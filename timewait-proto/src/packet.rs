//! Construction of the datagrams sent on behalf of closed connections
//!
//! The time-wait list never encrypts anything itself. Replies are either termination packets
//! that were serialized while the connection was still alive, or one of the unprotected packet
//! types built here: stateless resets, Google QUIC public resets and version negotiation.

use std::{fmt::Debug, net::SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use tracing::trace;

use crate::{shared::ConnectionId, token::ResetToken, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Which header format a closed connection spoke
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketFormat {
    /// IETF QUIC invariant headers
    Ietf,
    /// Google QUIC public headers
    ///
    /// Replies in this format always carry an 8-byte connection ID, so the IDs of such
    /// connections must be exactly 8 bytes long.
    Google,
}

impl PacketFormat {
    /// Shorthand for `self == PacketFormat::Ietf`
    pub fn is_ietf(self) -> bool {
        self == Self::Ietf
    }
}

/// Builds the reply packets the time-wait list cannot replay verbatim
pub trait PacketBuilder: Send + Debug {
    /// Google QUIC public reset carrying `nonce_proof` and the address the peer was seen at
    fn build_public_reset(
        &mut self,
        id: &ConnectionId,
        nonce_proof: u64,
        client_address: SocketAddr,
    ) -> Bytes;

    /// IETF stateless reset ending in `token`
    fn build_stateless_reset(&mut self, id: &ConnectionId, token: &ResetToken) -> Bytes;

    /// Version negotiation offering `supported_versions`
    fn build_version_negotiation(
        &mut self,
        id: &ConnectionId,
        format: PacketFormat,
        supported_versions: &[u32],
    ) -> Bytes;
}

/// [`PacketBuilder`] producing standard wire formats
#[derive(Debug)]
pub struct DefaultPacketBuilder {
    rng: StdRng,
}

impl DefaultPacketBuilder {
    /// Create a builder, seeding its random bits from `seed` or from the OS if `None`
    pub fn new(seed: Option<[u8; 32]>) -> Self {
        Self {
            rng: seed.map_or_else(StdRng::from_os_rng, StdRng::from_seed),
        }
    }
}

impl Default for DefaultPacketBuilder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PacketBuilder for DefaultPacketBuilder {
    fn build_public_reset(
        &mut self,
        id: &ConnectionId,
        nonce_proof: u64,
        client_address: SocketAddr,
    ) -> Bytes {
        debug_assert_eq!(id.len(), GOOGLE_CID_LEN, "public headers carry 8-byte connection IDs");
        let mut address = Vec::with_capacity(20);
        encode_socket_address(&mut address, client_address);
        let nonce = nonce_proof.to_le_bytes();
        // Entries must be sorted by tag value
        let entries: [(u32, &[u8]); 2] = [(TAG_RNON, &nonce[..]), (TAG_CADR, &address[..])];
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

        let mut buf = BytesMut::with_capacity(1 + id.len() + 8 + 16 + 8 + address.len());
        buf.put_u8(PUBLIC_FLAG_RESET | PUBLIC_FLAG_8BYTE_CID);
        buf.put_slice(id);
        buf.put_u32_le(TAG_PRST);
        buf.put_u16_le(entries.len() as u16);
        buf.put_u16_le(0);
        let mut end_offset = 0;
        for (tag, value) in &entries {
            end_offset += value.len() as u32;
            buf.put_u32_le(*tag);
            buf.put_u32_le(end_offset);
        }
        for (_, value) in &entries {
            buf.put_slice(value);
        }
        trace!(%id, len = buf.len(), "built public reset");
        buf.freeze()
    }

    fn build_stateless_reset(&mut self, id: &ConnectionId, token: &ResetToken) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATELESS_RESET_PADDING_LEN + RESET_TOKEN_SIZE);
        buf.resize(STATELESS_RESET_PADDING_LEN, 0);
        self.rng.fill_bytes(&mut buf[..]);
        // Short header form with the fixed bit set; the rest is unpredictable
        buf[0] = 0b0100_0000 | buf[0] >> 2;
        buf.put_slice(token);
        trace!(%id, len = buf.len(), "built stateless reset");
        buf.freeze()
    }

    fn build_version_negotiation(
        &mut self,
        id: &ConnectionId,
        format: PacketFormat,
        supported_versions: &[u32],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * MAX_CID_SIZE + 4 * (supported_versions.len() + 3));
        match format {
            PacketFormat::Ietf => {
                buf.put_u8(0x80 | self.rng.random::<u8>());
                buf.put_u32(0);
                buf.put_u8(id.len() as u8);
                buf.put_slice(id);
                // No source connection ID
                buf.put_u8(0);
                // Grease with a reserved version
                buf.put_u32((self.rng.random::<u32>() & 0xf0f0_f0f0) | 0x0a0a_0a0a);
            }
            PacketFormat::Google => {
                debug_assert_eq!(
                    id.len(),
                    GOOGLE_CID_LEN,
                    "public headers carry 8-byte connection IDs"
                );
                buf.put_u8(PUBLIC_FLAG_VERSION | PUBLIC_FLAG_8BYTE_CID);
                buf.put_slice(id);
            }
        }
        for &version in supported_versions {
            buf.put_u32(version);
        }
        trace!(%id, ?format, len = buf.len(), "built version negotiation");
        buf.freeze()
    }
}

fn encode_socket_address(buf: &mut Vec<u8>, address: SocketAddr) {
    match address {
        SocketAddr::V4(x) => {
            buf.put_u16_le(ADDRESS_FAMILY_IPV4);
            buf.put_slice(&x.ip().octets());
        }
        SocketAddr::V6(x) => {
            buf.put_u16_le(ADDRESS_FAMILY_IPV6);
            buf.put_slice(&x.ip().octets());
        }
    }
    buf.put_u16_le(address.port());
}

const fn tag(name: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*name)
}

/// Minimum amount of padding for the stateless reset to look like a short-header packet
const MIN_PADDING_LEN: usize = 5;
/// Resets with at least this much padding can't possibly be distinguished from real packets
const STATELESS_RESET_PADDING_LEN: usize = MIN_PADDING_LEN + MAX_CID_SIZE;

const PUBLIC_FLAG_VERSION: u8 = 0x01;
const PUBLIC_FLAG_RESET: u8 = 0x02;
const PUBLIC_FLAG_8BYTE_CID: u8 = 0x08;
const GOOGLE_CID_LEN: usize = 8;

const TAG_PRST: u32 = tag(b"PRST");
const TAG_RNON: u32 = tag(b"RNON");
const TAG_CADR: u32 = tag(b"CADR");

const ADDRESS_FAMILY_IPV4: u16 = 2;
const ADDRESS_FAMILY_IPV6: u16 = 10;
