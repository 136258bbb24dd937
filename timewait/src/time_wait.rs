use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use proto::{
    ConnectionId, PacketFormat, PacketWriter, PerPacketContext, ResetToken, TimeWaitAction,
    TimeWaitConfig, TimeWaitListManager, TimeWaitStats, Visitor,
};
use tokio::time::{sleep_until, Sleep};
use tracing::{debug, trace};

use crate::{
    alarm::{AlarmHandle, DriverSignal},
    clock::TokioClock,
    mutex::Mutex,
    udp::UdpPacketWriter,
};

/// A time-wait list answering on a tokio UDP socket
///
/// Cheap to clone; all clones refer to the same list. The list only makes progress on cleanup
/// and on replies queued behind a full socket while its [`TimeWaitDriver`] is being polled.
#[derive(Debug)]
pub struct TimeWait(Arc<Shared>);

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    writer: Arc<UdpPacketWriter>,
    alarm: AlarmHandle,
    signal: Arc<DriverSignal>,
}

#[derive(Debug)]
struct State {
    manager: TimeWaitListManager,
    /// Number of live `TimeWait` handles; excludes the driver
    ref_count: usize,
}

impl TimeWait {
    /// Serve a time-wait list on `socket`
    ///
    /// The returned driver must be spawned on a tokio runtime. Fails if `socket` can't be
    /// configured to send from a chosen local address.
    pub fn new(
        config: Arc<TimeWaitConfig>,
        socket: Arc<tokio::net::UdpSocket>,
    ) -> io::Result<(Self, TimeWaitDriver)> {
        Self::with_visitor(config, socket, None)
    }

    /// Like [`new`](Self::new), forwarding the manager's notifications to `visitor`
    pub fn with_visitor(
        config: Arc<TimeWaitConfig>,
        socket: Arc<tokio::net::UdpSocket>,
        visitor: Option<Box<dyn Visitor>>,
    ) -> io::Result<(Self, TimeWaitDriver)> {
        let writer = Arc::new(UdpPacketWriter::new(socket)?);
        let signal = Arc::new(DriverSignal::default());
        let alarm = AlarmHandle::new(signal.clone());
        let manager = TimeWaitListManager::new(
            config,
            writer.clone(),
            Box::new(WriteBlockedSignal {
                signal: signal.clone(),
                inner: visitor,
            }),
            Arc::new(TokioClock),
            &alarm,
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                manager,
                ref_count: 1,
            }),
            writer,
            alarm,
            signal,
        });
        Ok((
            Self(shared.clone()),
            TimeWaitDriver {
                shared,
                timer: CleanupTimer::default(),
            },
        ))
    }

    /// Start answering packets for `id`
    ///
    /// See [`TimeWaitListManager::add_connection_id_to_time_wait`].
    pub fn add_connection_id_to_time_wait(
        &self,
        id: ConnectionId,
        format: PacketFormat,
        action: TimeWaitAction,
        termination_packets: Vec<Bytes>,
    ) {
        self.0
            .state
            .lock("add_connection_id_to_time_wait")
            .manager
            .add_connection_id_to_time_wait(id, format, action, termination_packets);
    }

    /// Whether `id` is currently in the time-wait list
    pub fn is_connection_id_in_time_wait(&self, id: &ConnectionId) -> bool {
        self.0
            .state
            .lock("is_connection_id_in_time_wait")
            .manager
            .is_connection_id_in_time_wait(id)
    }

    /// Answer a packet addressed to `id`
    ///
    /// Returns `false` without doing anything if `id` is not in the time-wait list, so callers
    /// need not check first.
    pub fn process_packet(
        &self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        id: ConnectionId,
        context: Option<&dyn PerPacketContext>,
    ) -> bool {
        let mut state = self.0.state.lock("process_packet");
        if !state.manager.is_connection_id_in_time_wait(&id) {
            return false;
        }
        state
            .manager
            .process_packet(self_address, peer_address, id, context);
        true
    }

    /// Send a version negotiation packet to `peer_address`
    pub fn send_version_negotiation_packet(
        &self,
        id: ConnectionId,
        format: PacketFormat,
        supported_versions: &[u32],
        self_address: SocketAddr,
        peer_address: SocketAddr,
        context: Option<&dyn PerPacketContext>,
    ) {
        self.0
            .state
            .lock("send_version_negotiation_packet")
            .manager
            .send_version_negotiation_packet(
                id,
                format,
                supported_versions,
                self_address,
                peer_address,
                context,
            );
    }

    /// Number of connection IDs in the time-wait list
    pub fn num_connections(&self) -> usize {
        self.0.state.lock("num_connections").manager.num_connections()
    }

    /// Whether replies are waiting for the socket to drain
    pub fn has_pending_packets(&self) -> bool {
        self.0
            .state
            .lock("has_pending_packets")
            .manager
            .has_pending_packets()
    }

    /// The stateless reset token sent in resets for `id`
    pub fn stateless_reset_token(&self, id: &ConnectionId) -> ResetToken {
        self.0
            .state
            .lock("stateless_reset_token")
            .manager
            .stateless_reset_token(id)
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> TimeWaitStats {
        self.0.state.lock("stats").manager.stats()
    }

    /// The writer replies are sent through
    pub fn writer(&self) -> &Arc<UdpPacketWriter> {
        &self.0.writer
    }
}

impl Clone for TimeWait {
    fn clone(&self) -> Self {
        self.0.state.lock("clone").ref_count += 1;
        Self(self.0.clone())
    }
}

impl Drop for TimeWait {
    fn drop(&mut self) {
        let mut state = self.0.state.lock("drop");
        if let Some(x) = state.ref_count.checked_sub(1) {
            state.ref_count = x;
            if x == 0 {
                // Let the driver notice it's on its own
                self.0.signal.wake();
            }
        }
    }
}

/// Services the cleanup alarm and the socket's writability for a [`TimeWait`]
///
/// Resolves once every `TimeWait` handle has been dropped, or with an error if the socket fails.
#[must_use = "time-wait drivers must be spawned for cleanup and queued replies to make progress"]
#[derive(Debug)]
pub struct TimeWaitDriver {
    shared: Arc<Shared>,
    timer: CleanupTimer,
}

impl Future for TimeWaitDriver {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        this.shared.signal.register(cx.waker());
        let mut state = this.shared.state.lock("poll");
        loop {
            if this.timer.poll(&this.shared.alarm, cx) {
                state.manager.clean_up_old_connection_ids();
                continue;
            }

            if state.manager.has_pending_packets() || this.shared.writer.is_write_blocked() {
                match this.shared.writer.poll_writable(cx) {
                    Poll::Ready(Ok(())) => {
                        trace!("writer unblocked");
                        state.manager.on_blocked_writer_can_write();
                        if state.manager.has_pending_packets() {
                            // Blocked again; poll once more to register for the next edge
                            continue;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }
            break;
        }

        if state.ref_count == 0 {
            debug!(
                remaining = state.manager.num_connections(),
                "time-wait driver finished"
            );
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }
}

/// Tokio timer tracking the deadline of the cleanup alarm
#[derive(Debug, Default)]
struct CleanupTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    armed_for: Option<Instant>,
}

impl CleanupTimer {
    /// Whether the alarm fired; consumes the firing
    fn poll(&mut self, alarm: &AlarmHandle, cx: &mut Context<'_>) -> bool {
        let Some(deadline) = alarm.deadline() else {
            self.armed_for = None;
            return false;
        };
        if self.armed_for != Some(deadline) {
            match &mut self.sleep {
                Some(sleep) => sleep.as_mut().reset(deadline.into()),
                None => self.sleep = Some(Box::pin(sleep_until(deadline.into()))),
            }
            self.armed_for = Some(deadline);
        }
        let Some(sleep) = &mut self.sleep else {
            return false;
        };
        if sleep.as_mut().poll(cx).is_pending() {
            return false;
        }
        self.armed_for = None;
        alarm.take_if(deadline)
    }
}

/// Wakes the driver when a reply gets queued, then forwards to the user's visitor
struct WriteBlockedSignal {
    signal: Arc<DriverSignal>,
    inner: Option<Box<dyn Visitor>>,
}

impl Visitor for WriteBlockedSignal {
    fn on_connection_added_to_time_wait_list(&mut self, id: ConnectionId) {
        if let Some(inner) = &mut self.inner {
            inner.on_connection_added_to_time_wait_list(id);
        }
    }

    fn on_write_blocked(&mut self) {
        self.signal.wake();
        if let Some(inner) = &mut self.inner {
            inner.on_write_blocked();
        }
    }
}
