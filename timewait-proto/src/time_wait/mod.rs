use std::{
    collections::VecDeque,
    fmt, io,
    net::SocketAddr,
    sync::Arc,
};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::{
    alarm::{Alarm, AlarmFactory},
    clock::Clock,
    config::TimeWaitConfig,
    packet::{DefaultPacketBuilder, PacketBuilder, PacketFormat},
    shared::ConnectionId,
    token::ResetToken,
    writer::{PacketWriter, WriteResult},
    Duration, Instant, QueuedPacket,
};

mod map;
use map::ConnectionIdMap;

/// Nonce proof carried by Google QUIC public resets
///
/// Public resets sent from the time-wait list have no per-connection secret to prove, so a fixed
/// value is used.
const PUBLIC_RESET_NONCE_PROOF: u64 = 1010101;

/// How to answer packets for a connection ID in the time-wait list
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeWaitAction {
    /// Replay the termination packets captured when the connection closed
    SendTerminationPackets,
    /// Answer with a stateless reset, or a public reset for Google QUIC
    SendStatelessReset,
    /// Silently discard packets
    ///
    /// Only meaningful for IETF QUIC.
    DoNothing,
}

/// Receives notifications from a [`TimeWaitListManager`]
///
/// Called synchronously from inside the manager; implementations must not block.
pub trait Visitor: Send {
    /// `id` was added to the time-wait list for the first time
    ///
    /// Not called when an entry that is already present gets replaced.
    fn on_connection_added_to_time_wait_list(&mut self, id: ConnectionId) {
        let _ = id;
    }

    /// A write was refused because the writer is blocked
    ///
    /// The owner should arrange for
    /// [`TimeWaitListManager::on_blocked_writer_can_write`] to be called once the writer becomes
    /// writable again.
    fn on_write_blocked(&mut self) {}
}

impl Visitor for () {}

/// Opaque per-packet information supplied by the dispatcher
///
/// Passed through to diagnostics; the manager never interprets it.
pub trait PerPacketContext: fmt::Debug + Send + Sync {}

/// Whether the `count`th packet received for a connection ID should be answered
///
/// True exactly when `count` is a power of two, so the number of replies grows logarithmically
/// with the number of packets a peer keeps sending.
pub fn should_send_response(count: u64) -> bool {
    debug_assert!(count > 0, "packet counts start at 1");
    count.is_power_of_two()
}

/// Counters describing the work done by a [`TimeWaitListManager`]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct TimeWaitStats {
    /// Packets received for connection IDs in the time-wait list
    pub packets_received: u64,
    /// Received packets that went unanswered due to exponential backoff
    pub responses_throttled: u64,
    /// Replies handed to the writer
    pub packets_written: u64,
    /// Replies queued because the writer was blocked
    pub packets_queued: u64,
    /// Replies discarded because the retry queue was full
    pub packets_dropped: u64,
    /// Replies the writer failed to send
    pub write_errors: u64,
    /// Connection IDs forgotten after the time-wait period elapsed
    pub expired: u64,
    /// Connection IDs forgotten early to stay within `max_connections`
    pub evicted: u64,
}

/// State retained for each connection ID
#[derive(Debug)]
struct ConnectionIdData {
    /// Packets received since the connection ID was first added, across replacements
    num_packets: u64,
    format: PacketFormat,
    time_added: Instant,
    action: TimeWaitAction,
    termination_packets: Vec<Bytes>,
}

/// Keeps track of closed connections and answers packets that keep arriving for them
///
/// Connection IDs stay in the list for the configured time-wait period, after which a cleanup
/// sweep forgets them. The sweep is scheduled on an [`Alarm`]; whoever drives the alarm must call
/// [`clean_up_old_connection_ids`](Self::clean_up_old_connection_ids) when it fires.
///
/// Replies go through a shared [`PacketWriter`]. When it is blocked they are queued in order and
/// sent by [`on_blocked_writer_can_write`](Self::on_blocked_writer_can_write).
pub struct TimeWaitListManager {
    config: Arc<TimeWaitConfig>,
    /// Entries ordered oldest first
    connection_ids: ConnectionIdMap<ConnectionIdData>,
    /// Replies waiting for the writer to unblock
    pending: VecDeque<QueuedPacket>,
    /// Total length of the datagrams in `pending`
    pending_bytes: usize,
    writer: Arc<dyn PacketWriter>,
    visitor: Box<dyn Visitor>,
    clock: Arc<dyn Clock>,
    cleanup_alarm: Box<dyn Alarm>,
    builder: Box<dyn PacketBuilder>,
    /// When a write error was last logged
    last_write_error: Option<Instant>,
    stats: TimeWaitStats,
}

impl TimeWaitListManager {
    /// Create a manager using the [`DefaultPacketBuilder`]
    ///
    /// The cleanup alarm is created from `alarm_factory` and armed immediately.
    pub fn new(
        config: Arc<TimeWaitConfig>,
        writer: Arc<dyn PacketWriter>,
        visitor: Box<dyn Visitor>,
        clock: Arc<dyn Clock>,
        alarm_factory: &dyn AlarmFactory,
    ) -> Self {
        let builder = Box::new(DefaultPacketBuilder::new(config.rng_seed));
        Self::with_packet_builder(config, writer, visitor, clock, alarm_factory, builder)
    }

    /// Create a manager that builds its replies with `builder`
    pub fn with_packet_builder(
        config: Arc<TimeWaitConfig>,
        writer: Arc<dyn PacketWriter>,
        visitor: Box<dyn Visitor>,
        clock: Arc<dyn Clock>,
        alarm_factory: &dyn AlarmFactory,
        builder: Box<dyn PacketBuilder>,
    ) -> Self {
        let mut this = Self {
            config,
            connection_ids: ConnectionIdMap::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            writer,
            visitor,
            clock,
            cleanup_alarm: alarm_factory.create_alarm(),
            builder,
            last_write_error: None,
            stats: TimeWaitStats::default(),
        };
        this.set_connection_id_clean_up_alarm();
        this
    }

    /// Start answering packets for `id` on behalf of a closed connection
    ///
    /// If `id` is already present its entry is replaced, but the number of packets received so
    /// far is kept so that backoff continues where it left off. The oldest entries are evicted
    /// first if the list is full.
    ///
    /// # Panics
    ///
    /// If `action` is [`TimeWaitAction::SendTerminationPackets`] and `termination_packets` is
    /// empty, or if `action` is [`TimeWaitAction::DoNothing`] for [`PacketFormat::Google`].
    pub fn add_connection_id_to_time_wait(
        &mut self,
        id: ConnectionId,
        format: PacketFormat,
        action: TimeWaitAction,
        termination_packets: Vec<Bytes>,
    ) {
        assert!(
            action != TimeWaitAction::SendTerminationPackets || !termination_packets.is_empty(),
            "termination packets required to send termination packets"
        );
        assert!(
            action != TimeWaitAction::DoNothing || format.is_ietf(),
            "only IETF QUIC connections can be silently dropped"
        );

        let previous = self.connection_ids.remove(&id);
        let is_new = previous.is_none();
        let num_packets = previous.map_or(0, |data| data.num_packets);
        self.trim_time_wait_list_if_needed();
        debug_assert!(self
            .config
            .max_connections
            .map_or(true, |max| self.connection_ids.len() < max));

        trace!(%id, ?format, ?action, replaced = !is_new, "adding to time-wait list");
        self.connection_ids.push_newest(
            id,
            ConnectionIdData {
                num_packets,
                format,
                time_added: self.clock.approximate_now(),
                action,
                termination_packets,
            },
        );
        if is_new {
            self.visitor.on_connection_added_to_time_wait_list(id);
        }
    }

    /// Whether `id` is currently in the time-wait list
    pub fn is_connection_id_in_time_wait(&self, id: &ConnectionId) -> bool {
        self.connection_ids.contains(id)
    }

    /// Handle a packet received for a connection ID in the time-wait list
    ///
    /// The caller must have checked [`is_connection_id_in_time_wait`]. Packets for other
    /// connection IDs are a logic error; they trigger a debug assertion and are otherwise ignored.
    ///
    /// [`is_connection_id_in_time_wait`]: Self::is_connection_id_in_time_wait
    pub fn process_packet(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        id: ConnectionId,
        context: Option<&dyn PerPacketContext>,
    ) {
        let Some(data) = self.connection_ids.get_mut(&id) else {
            debug_assert!(false, "packet for {id} which is not in the time-wait list");
            error!(%id, "packet for connection ID not in the time-wait list");
            return;
        };
        self.stats.packets_received += 1;
        data.num_packets = data.num_packets.saturating_add(1);
        if !should_send_response(data.num_packets) {
            trace!(%id, count = data.num_packets, "throttled");
            self.stats.responses_throttled += 1;
            return;
        }

        trace!(
            %id,
            format = ?data.format,
            action = ?data.action,
            termination_packets = data.termination_packets.len(),
            "processing packet in time-wait state"
        );
        match data.action {
            TimeWaitAction::SendTerminationPackets => {
                if data.termination_packets.is_empty() {
                    error!(%id, "no termination packets");
                    return;
                }
                let packets = data.termination_packets.clone();
                for packet in packets {
                    self.send_or_queue_packet(
                        QueuedPacket::new(self_address, peer_address, packet),
                        context,
                    );
                }
            }
            TimeWaitAction::SendStatelessReset => {
                let format = data.format;
                self.send_public_reset(self_address, peer_address, id, format, context);
            }
            TimeWaitAction::DoNothing => {
                debug_assert!(data.format.is_ietf());
                trace!(%id, "dropping packet silently");
            }
        }
    }

    /// Tell a peer which versions are supported
    ///
    /// Builds and sends exactly one version negotiation packet. `id` need not be in the time-wait
    /// list, and the list is left untouched.
    pub fn send_version_negotiation_packet(
        &mut self,
        id: ConnectionId,
        format: PacketFormat,
        supported_versions: &[u32],
        self_address: SocketAddr,
        peer_address: SocketAddr,
        context: Option<&dyn PerPacketContext>,
    ) {
        let packet = self
            .builder
            .build_version_negotiation(&id, format, supported_versions);
        debug!(%id, %peer_address, "sending version negotiation");
        self.send_or_queue_packet(QueuedPacket::new(self_address, peer_address, packet), context);
    }

    /// Write `packet` now, or queue it if the writer is blocked
    ///
    /// Returns `true` if the packet no longer needs to be retained: it was written, buffered by
    /// the writer, or failed with an error that is not worth retrying. Returns `false` if it was
    /// queued, or dropped because the queue is full.
    pub fn send_or_queue_packet(
        &mut self,
        packet: QueuedPacket,
        context: Option<&dyn PerPacketContext>,
    ) -> bool {
        if let Some(context) = context {
            trace!(?context, peer = %packet.peer_address, "sending reply");
        }
        if self.write_to_wire(&packet) {
            return true;
        }
        if self.pending_bytes + packet.packet.len() > self.config.max_pending_bytes {
            debug!(
                peer = %packet.peer_address,
                len = packet.packet.len(),
                pending = self.pending_bytes,
                "dropping reply: retry queue full"
            );
            self.stats.packets_dropped += 1;
            return false;
        }
        self.pending_bytes += packet.packet.len();
        self.stats.packets_queued += 1;
        self.pending.push_back(packet);
        false
    }

    /// Send queued replies now that the writer has room
    ///
    /// Replies go out in the order they were queued. Stops at the first one the writer refuses,
    /// leaving it and everything after it queued.
    pub fn on_blocked_writer_can_write(&mut self) {
        self.writer.set_writable();
        while let Some(packet) = self.pending.pop_front() {
            if !self.write_to_wire(&packet) {
                self.pending.push_front(packet);
                return;
            }
            self.pending_bytes -= packet.packet.len();
        }
    }

    /// Forget connection IDs that have been in the list for the whole time-wait period
    ///
    /// Must be called whenever the cleanup alarm fires. Reschedules the alarm.
    pub fn clean_up_old_connection_ids(&mut self) {
        let now = self.clock.approximate_now();
        // Without a representable expiration time nothing can have expired yet
        if let Some(expiration) = now.checked_sub(self.config.time_wait_period) {
            while self.maybe_expire_oldest_connection(Some(expiration)) {
                self.stats.expired += 1;
            }
        }
        self.set_connection_id_clean_up_alarm();
    }

    /// Number of connection IDs in the time-wait list
    pub fn num_connections(&self) -> usize {
        self.connection_ids.len()
    }

    /// Whether any replies are waiting for the writer to unblock
    pub fn has_pending_packets(&self) -> bool {
        !self.pending.is_empty()
    }

    /// How long connection IDs are retained
    pub fn time_wait_period(&self) -> Duration {
        self.config.time_wait_period
    }

    /// The configuration this manager was created with
    pub fn config(&self) -> &TimeWaitConfig {
        &self.config
    }

    /// The stateless reset token sent in resets for `id`
    pub fn stateless_reset_token(&self, id: &ConnectionId) -> ResetToken {
        ResetToken::new(&*self.config.reset_key, id)
    }

    /// Counters accumulated since construction
    pub fn stats(&self) -> TimeWaitStats {
        self.stats
    }

    fn send_public_reset(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        id: ConnectionId,
        format: PacketFormat,
        context: Option<&dyn PerPacketContext>,
    ) {
        let packet = match format {
            PacketFormat::Ietf => {
                let token = self.stateless_reset_token(&id);
                self.builder.build_stateless_reset(&id, &token)
            }
            PacketFormat::Google => {
                self.builder
                    .build_public_reset(&id, PUBLIC_RESET_NONCE_PROOF, peer_address)
            }
        };
        debug!(%id, %peer_address, ?format, "sending reset");
        self.send_or_queue_packet(QueuedPacket::new(self_address, peer_address, packet), context);
    }

    /// Hand `packet` to the writer
    ///
    /// Returns `false` only if the packet must be retried later.
    fn write_to_wire(&mut self, packet: &QueuedPacket) -> bool {
        if self.writer.is_write_blocked() {
            self.visitor.on_write_blocked();
            return false;
        }
        let mut result =
            self.writer
                .write_packet(&packet.packet, packet.self_address.ip(), packet.peer_address);
        // Batching writers may hold on to the datagram until flushed
        if self.writer.is_batch_mode() && matches!(result, WriteResult::Written(0)) {
            result = self.writer.flush();
        }

        match result {
            WriteResult::Written(_) => {
                self.stats.packets_written += 1;
                true
            }
            WriteResult::BlockedDataBuffered => {
                debug_assert!(self.writer.is_write_blocked());
                self.visitor.on_write_blocked();
                self.stats.packets_written += 1;
                true
            }
            WriteResult::Blocked => {
                debug_assert!(self.writer.is_write_blocked());
                self.visitor.on_write_blocked();
                false
            }
            WriteResult::Error(e) => {
                self.stats.write_errors += 1;
                self.log_write_error(packet, &e);
                true
            }
        }
    }

    fn log_write_error(&mut self, packet: &QueuedPacket, err: &io::Error) {
        let now = self.clock.approximate_now();
        let due = self.last_write_error.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.error_log_interval
        });
        if due {
            self.last_write_error = Some(now);
            warn!(
                peer = %packet.peer_address,
                len = packet.packet.len(),
                "failed to send termination reply: {err}"
            );
        }
    }

    /// Schedule the cleanup alarm for when the oldest entry expires
    pub(crate) fn set_connection_id_clean_up_alarm(&mut self) {
        let now = self.clock.approximate_now();
        let period = self.config.time_wait_period;
        let next = match self.connection_ids.oldest() {
            // Nothing can expire before a full period has passed
            None => period,
            Some((id, data)) => {
                let age = now.saturating_duration_since(data.time_added);
                match period.checked_sub(age) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => {
                        error!(%id, ?age, "connection ID lingered longer than the time-wait period");
                        Duration::ZERO
                    }
                }
            }
        };
        match now.checked_add(next) {
            Some(deadline) => self.cleanup_alarm.update(deadline, Duration::ZERO),
            None => {
                // Entries outlive any representable instant, so there's nothing to schedule
                debug!(?period, "time-wait period too long to schedule cleanup");
                self.cleanup_alarm.cancel();
            }
        }
    }

    /// Remove the oldest entry if it was added no later than `expiration`
    ///
    /// `None` means every entry is eligible. Only the oldest entry is examined. Returns whether
    /// an entry was removed.
    fn maybe_expire_oldest_connection(&mut self, expiration: Option<Instant>) -> bool {
        let Some((_, data)) = self.connection_ids.oldest() else {
            return false;
        };
        if expiration.is_some_and(|expiration| data.time_added > expiration) {
            return false;
        }
        if let Some((id, _)) = self.connection_ids.pop_oldest() {
            debug!(%id, "expired from time-wait list");
        }
        true
    }

    /// Evict the oldest entries until there is room for one more
    fn trim_time_wait_list_if_needed(&mut self) {
        let Some(max) = self.config.max_connections else {
            return;
        };
        while self.connection_ids.len() >= max && self.maybe_expire_oldest_connection(None) {
            self.stats.evicted += 1;
        }
    }
}

impl Drop for TimeWaitListManager {
    fn drop(&mut self) {
        // Must happen before the entries it would sweep go away
        self.cleanup_alarm.cancel();
        self.connection_ids.clear();
    }
}

impl fmt::Debug for TimeWaitListManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWaitListManager")
            .field("config", &self.config)
            .field("num_connections", &self.connection_ids.len())
            .field("pending", &self.pending.len())
            .field("pending_bytes", &self.pending_bytes)
            .field("writer", &self.writer)
            .field("cleanup_alarm", &self.cleanup_alarm)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
