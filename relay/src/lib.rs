//! A one-to-many relay for CTMP streams: a single trusted source connects to one listening port,
//!  any number of destinations (up to a configured maximum) connect to another, and every valid
//!  frame the source sends is copied verbatim to every destination.
//!
//! The relay is a single-threaded event loop ([relay::Relay]) on top of `mio`. All connection
//!  state lives in a [registry::ConnectionRegistry] with fixed-size buffers per connection, and
//!  a slow destination throttles the source ([broadcast]) rather than letting buffers grow.

pub mod broadcast;
pub mod buffers;
pub mod config;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod shutdown;
pub mod stats;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
