//! Bookkeeping for all relayed connections: the single source slot and a fixed arena of
//!  destination slots. Slots are identified by [ConnToken]s, which double as the `mio` tokens
//!  the connections are registered with, so readiness events map back to slots without any
//!  lookup tables.

use std::fmt::{Display, Formatter};
use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ctmp::FrameViolation;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, info, trace, warn};

use crate::broadcast::{broadcast_frames, BroadcastReport};
use crate::buffers::{DrainOutcome, InboundBuffer, OutboundBuffer};
use crate::config::RelayConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnToken {
    SourceListener,
    DestinationListener,
    Source,
    Shutdown,
    Destination(usize),
}

impl ConnToken {
    const SOURCE_LISTENER: usize = 0;
    const DESTINATION_LISTENER: usize = 1;
    const SOURCE: usize = 2;
    const SHUTDOWN: usize = 3;
    const FIRST_DESTINATION: usize = 16;
}

impl From<ConnToken> for Token {
    fn from(value: ConnToken) -> Token {
        match value {
            ConnToken::SourceListener => Token(ConnToken::SOURCE_LISTENER),
            ConnToken::DestinationListener => Token(ConnToken::DESTINATION_LISTENER),
            ConnToken::Source => Token(ConnToken::SOURCE),
            ConnToken::Shutdown => Token(ConnToken::SHUTDOWN),
            ConnToken::Destination(slot) => Token(ConnToken::FIRST_DESTINATION + slot),
        }
    }
}

impl TryFrom<Token> for ConnToken {
    type Error = anyhow::Error;

    fn try_from(value: Token) -> anyhow::Result<ConnToken> {
        match value.0 {
            ConnToken::SOURCE_LISTENER => Ok(ConnToken::SourceListener),
            ConnToken::DESTINATION_LISTENER => Ok(ConnToken::DestinationListener),
            ConnToken::SOURCE => Ok(ConnToken::Source),
            ConnToken::SHUTDOWN => Ok(ConnToken::Shutdown),
            n if n >= ConnToken::FIRST_DESTINATION => Ok(ConnToken::Destination(n - ConnToken::FIRST_DESTINATION)),
            n => anyhow::bail!("unassigned token {}", n),
        }
    }
}

/// Why a connection was closed
#[derive(Debug)]
pub enum TeardownReason {
    /// orderly close by the peer
    Disconnected,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    /// the socket reported an error or a hangup
    HungUp(Option<io::Error>),
    /// the peer closed its sending side - destinations are not expected to do that
    HalfClosed,
    Violation(FrameViolation),
    IdleTimeout(Duration),
    Shutdown,
}

impl Display for TeardownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownReason::Disconnected => write!(f, "peer disconnected"),
            TeardownReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            TeardownReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            TeardownReason::HungUp(Some(e)) => write!(f, "hung up: {}", e),
            TeardownReason::HungUp(None) => write!(f, "hung up"),
            TeardownReason::HalfClosed => write!(f, "peer closed its sending side"),
            TeardownReason::Violation(v) => write!(f, "protocol violation: {}", v),
            TeardownReason::IdleTimeout(d) => write!(f, "no progress delivering pending data for {:?}", d),
            TeardownReason::Shutdown => write!(f, "relay shutting down"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted(ConnToken),
    Rejected,
}

pub struct SourceConnection {
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) buffer: InboundBuffer,
    /// whether the connection is currently subscribed for 'readable' - this is cleared while
    ///  backpressure is active
    pub(crate) reading: bool,
    /// the last read stopped because the buffer was full, so the socket may have more data
    ///  without signalling it again
    pub(crate) read_pending: bool,
    /// the peer closed the connection; the source is torn down after buffered frames were
    ///  processed
    pub(crate) closed: bool,
}

impl SourceConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

pub struct DestinationConnection {
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) buffer: OutboundBuffer,
    /// the last time the destination was known not to be stalled: when it was accepted, when
    ///  data was queued for it while its buffer was empty, or when a write made progress
    pub(crate) last_active: Instant,
    pub(crate) writable_interest: bool,
}

impl DestinationConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.buffer.has_pending() && now.saturating_duration_since(self.last_active) > timeout
    }

    /// writes as much pending data as the socket accepts without blocking
    pub(crate) fn flush(&mut self, now: Instant) -> io::Result<usize> {
        match self.buffer.drain_into(&mut self.stream) {
            DrainOutcome::Flushed(n) | DrainOutcome::Blocked(n) => {
                if n > 0 {
                    trace!("wrote {} bytes to destination {:?}, {} pending", n, self.peer_addr, self.buffer.pending());
                    self.last_active = now;
                }
                Ok(n)
            }
            DrainOutcome::Failed(e) => Err(e),
        }
    }

    /// Destinations have nothing to say, so anything they send is read and dropped. Returns the
    ///  reason for closing the connection if reading shows it is gone.
    pub(crate) fn discard_input(&mut self, scratch: &mut [u8]) -> Option<TeardownReason> {
        let mut discarded = 0;
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Some(TeardownReason::Disconnected),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Some(TeardownReason::ReadFailed(e)),
            }
        }
        if discarded > 0 {
            debug!("discarded {} bytes received from destination {:?}", discarded, self.peer_addr);
        }
        None
    }
}

pub struct ConnectionRegistry {
    source: Option<SourceConnection>,
    destinations: Vec<Option<DestinationConnection>>,
    source_buffer_size: usize,
    destination_buffer_size: usize,
    idle_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(config: &RelayConfig) -> ConnectionRegistry {
        ConnectionRegistry {
            source: None,
            destinations: (0..config.max_destinations).map(|_| None).collect(),
            source_buffer_size: config.source_buffer_size,
            destination_buffer_size: config.destination_buffer_size,
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn source(&self) -> Option<&SourceConnection> {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> Option<&mut SourceConnection> {
        self.source.as_mut()
    }

    pub fn destination(&self, slot: usize) -> Option<&DestinationConnection> {
        self.destinations.get(slot)?.as_ref()
    }

    pub fn destination_mut(&mut self, slot: usize) -> Option<&mut DestinationConnection> {
        self.destinations.get_mut(slot)?.as_mut()
    }

    pub fn max_destinations(&self) -> usize {
        self.destinations.len()
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.iter().flatten().count()
    }

    pub(crate) fn destinations_mut(&mut self) -> impl Iterator<Item = (usize, &mut DestinationConnection)> {
        self.destinations.iter_mut()
            .enumerate()
            .filter_map(|(slot, d)| d.as_mut().map(|d| (slot, d)))
    }

    /// slots of all live destinations, in slot order
    pub fn destination_slots(&self) -> Vec<usize> {
        self.destinations.iter()
            .enumerate()
            .filter(|(_, d)| d.is_some())
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Takes ownership of a newly accepted source connection, provided there is no source yet.
    ///  Otherwise the connection is closed right away.
    pub fn accept_source(&mut self, registry: &Registry, mut stream: TcpStream, peer_addr: SocketAddr) -> Admission {
        if let Some(existing) = &self.source {
            warn!("rejecting source connection from {:?}: already connected to source {:?}", peer_addr, existing.peer_addr);
            return Admission::Rejected;
        }

        if let Err(e) = registry.register(&mut stream, ConnToken::Source.into(), Interest::READABLE) {
            warn!("rejecting source connection from {:?}: registration failed: {}", peer_addr, e);
            return Admission::Rejected;
        }

        info!("accepted source connection from {:?}", peer_addr);
        self.source = Some(SourceConnection {
            stream,
            peer_addr,
            buffer: InboundBuffer::new(self.source_buffer_size),
            reading: true,
            read_pending: false,
            closed: false,
        });
        Admission::Accepted(ConnToken::Source)
    }

    /// Puts a newly accepted destination into the first free slot. If all slots are in use, the
    ///  connection is closed right away.
    ///
    /// Destinations start out without 'writable' interest since there is nothing to send yet.
    ///  They are registered for 'readable' though, which is how hangup and half-close are
    ///  reported.
    pub fn accept_destination(&mut self, registry: &Registry, mut stream: TcpStream, peer_addr: SocketAddr, now: Instant) -> Admission {
        let Some(slot) = self.destinations.iter().position(|d| d.is_none()) else {
            warn!("rejecting destination connection from {:?}: maximum of {} destinations reached", peer_addr, self.destinations.len());
            return Admission::Rejected;
        };

        let token = ConnToken::Destination(slot);
        if let Err(e) = registry.register(&mut stream, token.into(), Interest::READABLE) {
            warn!("rejecting destination connection from {:?}: registration failed: {}", peer_addr, e);
            return Admission::Rejected;
        }

        info!("accepted destination connection from {:?} in slot {}", peer_addr, slot);
        self.destinations[slot] = Some(DestinationConnection {
            stream,
            peer_addr,
            buffer: OutboundBuffer::new(self.destination_buffer_size),
            last_active: now,
            writable_interest: false,
        });
        Admission::Accepted(token)
    }

    /// Deregisters and closes the source connection. Destinations are not affected, they wait for
    ///  the next source. Calling this without a connected source does nothing.
    pub fn teardown_source(&mut self, registry: &Registry, reason: TeardownReason) -> bool {
        let Some(mut source) = self.source.take() else {
            return false;
        };

        if let Err(e) = registry.deregister(&mut source.stream) {
            debug!("error deregistering source {:?}: {}", source.peer_addr, e);
        }
        match source.buffered() {
            0 => warn!("closing source connection from {:?}: {}", source.peer_addr, reason),
            n => warn!("closing source connection from {:?}: {} - discarding {} buffered bytes", source.peer_addr, reason, n),
        }
        true
    }

    /// Deregisters and closes a destination connection, freeing its slot. Calling this for an
    ///  empty slot does nothing.
    pub fn teardown_destination(&mut self, registry: &Registry, slot: usize, reason: TeardownReason) -> bool {
        let Some(mut destination) = self.destinations.get_mut(slot).and_then(Option::take) else {
            return false;
        };

        if let Err(e) = registry.deregister(&mut destination.stream) {
            debug!("error deregistering destination {:?}: {}", destination.peer_addr, e);
        }
        warn!("closing destination connection from {:?} in slot {}: {} ({} bytes undelivered)", destination.peer_addr, slot, reason, destination.buffer.pending());
        true
    }

    /// Disconnects destinations that have pending data but made no progress writing it for
    ///  longer than the idle timeout. Destinations with nothing to send are left alone, no matter
    ///  how long they have been idle.
    pub fn reap_idle_destinations(&mut self, registry: &Registry, now: Instant) -> Vec<usize> {
        let timeout = self.idle_timeout;
        let stalled = self.destinations.iter()
            .enumerate()
            .filter(|(_, d)| d.as_ref().is_some_and(|d| d.is_stalled(now, timeout)))
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();

        for &slot in &stalled {
            self.teardown_destination(registry, slot, TeardownReason::IdleTimeout(timeout));
        }
        stalled
    }

    /// Runs the broadcast pass (see [broadcast_frames]) from the source buffer into the buffers
    ///  of all live destinations. Returns `None` if there is no source.
    pub fn broadcast(&mut self, now: Instant) -> Option<BroadcastReport> {
        let source = self.source.as_mut()?;

        let mut live = self.destinations.iter_mut()
            .flatten()
            .collect::<Vec<_>>();
        let was_empty = live.iter()
            .map(|d| !d.buffer.has_pending())
            .collect::<Vec<_>>();

        let report = {
            let mut buffers = live.iter_mut()
                .map(|d| &mut d.buffer)
                .collect::<Vec<_>>();
            broadcast_frames(&mut source.buffer, &mut buffers)
        };

        if report.frames > 0 {
            // the stall timer for a destination starts when it has something to send
            for (destination, was_empty) in live.iter_mut().zip(was_empty) {
                if was_empty {
                    destination.last_active = now;
                }
            }
        }

        trace!("broadcast pass: {:?}", report);
        Some(report)
    }

    /// closes all connections
    pub fn teardown_all(&mut self, registry: &Registry) {
        self.teardown_source(registry, TeardownReason::Shutdown);
        for slot in 0..self.destinations.len() {
            self.teardown_destination(registry, slot, TeardownReason::Shutdown);
        }
    }
}
