use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;
use ctmp::CtmpHeader;

pub struct RelayConfig {
    pub bind_ip: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,

    /// This is passed to `listen()` for both listening sockets. Rejected connections (a second
    ///  source, destinations in excess of `max_destinations`) are accepted and closed right
    ///  away, so they occupy the backlog only briefly.
    pub listen_backlog: i32,

    /// Destination connections beyond this number are closed immediately after they are
    ///  accepted. Each destination has a send buffer of `destination_buffer_size` bytes, so this
    ///  bounds the relay's memory usage.
    pub max_destinations: usize,

    /// Capacity of the source's receive buffer. A frame is only relayed once it is completely
    ///  buffered, so this must be at least the maximum frame length of 65543 bytes.
    pub source_buffer_size: usize,

    /// Capacity of each destination's send buffer. A frame is only copied into destination
    ///  buffers if it fits into all of them, so this must be at least the maximum frame length.
    pub destination_buffer_size: usize,

    /// A destination that has buffered data but did not accept any of it for this long is
    ///  disconnected. Destinations with empty buffers are never disconnected for being idle.
    pub idle_timeout: Duration,

    /// Upper bound for blocking in the readiness wait. This limits the delay with which idle
    ///  destinations are detected when there is no socket activity at all.
    pub poll_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_port: 33333,
            destination_port: 44444,
            listen_backlog: 128,
            max_destinations: 50,
            source_buffer_size: 128 * 1024,
            destination_buffer_size: 128 * 1024,
            idle_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(20),
        }
    }
}

impl RelayConfig {
    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.source_port)
    }

    pub fn destination_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.destination_port)
    }

    /// one event per destination, the source, both listeners and the shutdown waker
    pub fn events_capacity(&self) -> usize {
        self.max_destinations + 4
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_destinations == 0 {
            bail!("at least one destination must be allowed");
        }
        if self.source_buffer_size < CtmpHeader::MAX_FRAME_LEN {
            bail!("source buffer size {} is smaller than the maximum frame length {}", self.source_buffer_size, CtmpHeader::MAX_FRAME_LEN);
        }
        if self.destination_buffer_size < CtmpHeader::MAX_FRAME_LEN {
            bail!("destination buffer size {} is smaller than the maximum frame length {}", self.destination_buffer_size, CtmpHeader::MAX_FRAME_LEN);
        }
        if self.listen_backlog <= 0 {
            bail!("listen backlog must be positive");
        }
        if self.poll_timeout.is_zero() {
            bail!("poll timeout must not be zero");
        }
        if self.source_port != 0 && self.source_port == self.destination_port {
            bail!("source and destination must listen on different ports");
        }

        Ok(())
    }
}
