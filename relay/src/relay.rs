use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, trace, warn};

use crate::buffers::FillOutcome;
use crate::config::RelayConfig;
use crate::listener::bind_listener;
use crate::registry::{Admission, ConnToken, ConnectionRegistry, TeardownReason};
use crate::shutdown::ShutdownHandle;
use crate::stats::RelayStats;

/// The readiness flags of an event, copied out of `mio`'s event buffer so that handlers can
///  modify the relay while iterating
#[derive(Clone, Copy, Debug)]
struct Readiness {
    token: ConnToken,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl Readiness {
    fn of(event: &Event) -> Option<Readiness> {
        match ConnToken::try_from(event.token()) {
            Ok(token) => Some(Readiness {
                token,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
                write_closed: event.is_write_closed(),
            }),
            Err(e) => {
                warn!("ignoring event: {}", e);
                None
            }
        }
    }
}

/// The relay's event loop. It owns all sockets and connection state and runs on a single
///  thread: every wake-up dispatches readiness events to the listeners and connections, then runs
///  a single broadcast pass, reaps stalled destinations and finally adjusts the interest each
///  connection is registered with.
///
/// NB: `mio` registers sockets edge-triggered. All I/O therefore continues until the OS reports
///  `WouldBlock`, and the two cases where that does not happen (a full source buffer, and data
///  queued for a destination that is already writable) are driven by the loop itself rather than
///  by readiness events.
pub struct Relay {
    poll: Poll,
    events: Events,
    source_listener: TcpListener,
    destination_listener: TcpListener,
    connections: ConnectionRegistry,
    config: RelayConfig,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    stats: Arc<RelayStats>,
    backpressure: bool,
    scratch: Vec<u8>,
}

impl Relay {
    /// Binds both listening sockets. Failure here is fatal for the process.
    pub fn bind(config: RelayConfig) -> anyhow::Result<Relay> {
        config.validate()?;

        let poll = Poll::new()?;

        let mut source_listener = bind_listener(config.source_addr(), config.listen_backlog)?;
        let mut destination_listener = bind_listener(config.destination_addr(), config.listen_backlog)?;
        poll.registry().register(&mut source_listener, ConnToken::SourceListener.into(), Interest::READABLE)?;
        poll.registry().register(&mut destination_listener, ConnToken::DestinationListener.into(), Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), ConnToken::Shutdown.into())?);

        Ok(Relay {
            events: Events::with_capacity(config.events_capacity()),
            poll,
            source_listener,
            destination_listener,
            connections: ConnectionRegistry::new(&config),
            config,
            running: Arc::new(AtomicBool::new(true)),
            waker,
            stats: Default::default(),
            backpressure: false,
            scratch: vec![0; 4096],
        })
    }

    pub fn source_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.source_listener.local_addr()?)
    }

    pub fn destination_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.destination_listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.running.clone(), self.waker.clone())
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Runs the event loop until shutdown is requested through a [ShutdownHandle], closing all
    ///  connections before it returns. An error from the OS's readiness facility ends the loop
    ///  as well, and is returned after connections are closed.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("relaying CTMP from {:?} to {:?}", self.source_addr()?, self.destination_addr()?);

        let result = loop {
            if !self.running.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                error!("unrecoverable error in event loop: {}", e);
                break Err(e);
            }
        };

        self.close();
        result
    }

    /// A single iteration of the event loop: wait for readiness (bounded by the configured poll
    ///  timeout), dispatch the events, and do the per-wake-up housekeeping.
    pub fn run_once(&mut self) -> anyhow::Result<()> {
        let timeout = if self.has_unsignalled_input() {
            Duration::ZERO
        }
        else {
            self.config.poll_timeout
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let now = Instant::now();
        let ready = self.events.iter()
            .filter_map(Readiness::of)
            .collect::<Vec<_>>();

        // events that were collected before a connection was closed must not be applied to a
        //  connection that reuses its slot
        let mut closed = FxHashSet::default();

        for readiness in ready {
            if closed.contains(&readiness.token) {
                trace!("skipping event for closed connection: {:?}", readiness);
                continue;
            }

            match readiness.token {
                ConnToken::SourceListener => self.accept_sources(),
                ConnToken::DestinationListener => self.accept_destinations(now),
                ConnToken::Source => {
                    if self.on_source_ready(readiness) {
                        closed.insert(ConnToken::Source);
                    }
                }
                ConnToken::Destination(slot) => {
                    if self.on_destination_ready(slot, readiness, now) {
                        closed.insert(readiness.token);
                    }
                }
                ConnToken::Shutdown => debug!("woken up by shutdown handle"),
            }
        }

        self.pump(now);

        let reaped = self.connections.reap_idle_destinations(self.poll.registry(), now);
        self.stats.on_reaped(reaped.len());

        self.rearm();

        self.stats.set_connections(self.connections.source().is_some(), self.connections.num_destinations());
        Ok(())
    }

    /// The source stopped reading because its buffer was full: the OS will not signal the data
    ///  that is left in the socket again, so the loop must come back for it
    fn has_unsignalled_input(&self) -> bool {
        self.connections.source()
            .is_some_and(|s| s.reading && s.read_pending && !s.closed && !s.buffer.is_full())
    }

    fn accept_sources(&mut self) {
        loop {
            match self.source_listener.accept() {
                Ok((stream, peer_addr)) => {
                    let admission = self.connections.accept_source(self.poll.registry(), stream, peer_addr);
                    self.stats.on_source_admission(admission != Admission::Rejected);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("error accepting source connection: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_destinations(&mut self, now: Instant) {
        loop {
            match self.destination_listener.accept() {
                Ok((stream, peer_addr)) => {
                    let admission = self.connections.accept_destination(self.poll.registry(), stream, peer_addr, now);
                    self.stats.on_destination_admission(admission != Admission::Rejected);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("error accepting destination connection: {}", e);
                    break;
                }
            }
        }
    }

    /// returns `true` if the source was closed
    fn on_source_ready(&mut self, readiness: Readiness) -> bool {
        let Some(source) = self.connections.source_mut() else {
            return false;
        };

        if readiness.error {
            let e = source.stream.take_error().ok().flatten();
            return self.connections.teardown_source(self.poll.registry(), TeardownReason::HungUp(e));
        }

        if !source.reading {
            // paused for backpressure: the data stays in the socket until destinations catch up
            trace!("source readable while paused");
            return false;
        }

        self.read_source()
    }

    /// Reads from the source until the socket has no more data or the buffer is full. Returns
    ///  `true` if the source was closed.
    fn read_source(&mut self) -> bool {
        let Some(source) = self.connections.source_mut() else {
            return false;
        };

        match source.buffer.fill_from(&mut source.stream) {
            FillOutcome::Drained(n) => {
                trace!("read {} bytes from source, {} buffered", n, source.buffer.len());
                source.read_pending = false;
                false
            }
            FillOutcome::Full(n) => {
                trace!("read {} bytes from source, buffer is full", n);
                source.read_pending = true;
                false
            }
            FillOutcome::Closed(n) => {
                // buffered frames are still relayed in this iteration's broadcast pass
                debug!("source {:?} closed the connection after sending {} more bytes", source.peer_addr, n);
                source.closed = true;
                source.read_pending = false;
                false
            }
            FillOutcome::Failed(e) => {
                self.connections.teardown_source(self.poll.registry(), TeardownReason::ReadFailed(e))
            }
        }
    }

    /// returns `true` if the destination was closed
    fn on_destination_ready(&mut self, slot: usize, readiness: Readiness, now: Instant) -> bool {
        let Some(destination) = self.connections.destination_mut(slot) else {
            return false;
        };

        let reason = if readiness.error || readiness.write_closed {
            Some(TeardownReason::HungUp(destination.stream.take_error().ok().flatten()))
        }
        else if readiness.read_closed {
            Some(TeardownReason::HalfClosed)
        }
        else if readiness.readable {
            destination.discard_input(&mut self.scratch)
        }
        else {
            None
        };

        let reason = match reason {
            Some(reason) => Some(reason),
            None if readiness.writable => destination.flush(now).err().map(TeardownReason::WriteFailed),
            None => None,
        };

        match reason {
            Some(reason) => self.connections.teardown_destination(self.poll.registry(), slot, reason),
            None => false,
        }
    }

    /// The broadcast pass: moves complete frames from the source to the destinations' buffers
    ///  and starts writing them. Runs once per iteration, after all events were handled.
    fn pump(&mut self, now: Instant) {
        if self.has_unsignalled_input() {
            self.read_source();
        }

        let Some(report) = self.connections.broadcast(now) else {
            self.backpressure = false;
            return;
        };
        self.stats.on_relayed(report.frames, report.bytes);

        if report.backpressure != self.backpressure {
            if report.backpressure {
                debug!("backpressure: pausing reads from source");
                self.stats.on_backpressure();
            }
            else {
                debug!("backpressure cleared: resuming reads from source");
            }
            self.backpressure = report.backpressure;
        }

        if let Some(violation) = report.violation {
            self.connections.teardown_source(self.poll.registry(), TeardownReason::Violation(violation));
            self.backpressure = false;
        }
        else if self.connections.source().is_some_and(|s| s.closed) {
            self.connections.teardown_source(self.poll.registry(), TeardownReason::Disconnected);
            self.backpressure = false;
        }

        if report.frames > 0 {
            // a destination that is writable already will not be signalled again, so newly
            //  queued data is written right away
            let failed = self.connections.destinations_mut()
                .filter_map(|(slot, destination)| destination.flush(now).err().map(|e| (slot, e)))
                .collect::<Vec<_>>();

            for (slot, e) in failed {
                self.connections.teardown_destination(self.poll.registry(), slot, TeardownReason::WriteFailed(e));
            }
        }
    }

    /// Adjusts each connection's registered interest to its current state: the source is read
    ///  only while there is no backpressure, and destinations are interested in 'writable' only
    ///  while they have pending data.
    fn rearm(&mut self) {
        let registry = self.poll.registry();

        if let Some(source) = self.connections.source_mut() {
            if self.backpressure {
                source.reading = false;
            }
            else if !source.reading {
                // re-registering makes the OS report data that arrived while reads were paused
                if let Err(e) = registry.reregister(&mut source.stream, ConnToken::Source.into(), Interest::READABLE) {
                    warn!("failed to re-register source: {}", e);
                }
                source.reading = true;
                source.read_pending = true;
            }
        }

        let mut failed = Vec::new();
        for (slot, destination) in self.connections.destinations_mut() {
            let wants_writable = destination.buffer.has_pending();
            if wants_writable == destination.writable_interest {
                continue;
            }

            let interest = if wants_writable {
                Interest::READABLE | Interest::WRITABLE
            }
            else {
                Interest::READABLE
            };
            match registry.reregister(&mut destination.stream, ConnToken::Destination(slot).into(), interest) {
                Ok(()) => destination.writable_interest = wants_writable,
                Err(e) => failed.push((slot, e)),
            }
        }

        for (slot, e) in failed {
            self.connections.teardown_destination(self.poll.registry(), slot, TeardownReason::HungUp(Some(e)));
        }
    }

    fn close(&mut self) {
        info!("closing all connections");
        self.connections.teardown_all(self.poll.registry());

        for listener in [&mut self.source_listener, &mut self.destination_listener] {
            if let Err(e) = self.poll.registry().deregister(listener) {
                debug!("error deregistering listener: {}", e);
            }
        }
        self.stats.set_connections(false, 0);

        info!("relayed {} frames ({} bytes, source paused {} times); accepted {} sources ({} rejected) and {} destinations ({} rejected, {} timed out)",
            self.stats.frames_relayed(),
            self.stats.bytes_relayed(),
            self.stats.backpressure_pauses(),
            self.stats.sources_accepted(),
            self.stats.sources_rejected(),
            self.stats.destinations_accepted(),
            self.stats.destinations_rejected(),
            self.stats.destinations_reaped(),
        );
    }
}
