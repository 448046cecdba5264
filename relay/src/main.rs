use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use ctmp_relay::config::RelayConfig;
use ctmp_relay::relay::Relay;
use ctmp_relay::shutdown::ShutdownHandle;
use tracing::{error, info, Level};

/// Relays CTMP frames from a single source connection to all connected destinations
#[derive(Parser)]
struct Args {
    /// address to listen on for both source and destination connections
    #[clap(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[clap(short, long, default_value_t = 33333)]
    source_port: u16,

    #[clap(short, long, default_value_t = 44444)]
    destination_port: u16,

    #[clap(long, default_value_t = 50)]
    max_destinations: usize,

    #[clap(long, default_value_t = 128)]
    backlog: i32,

    /// size of the source's and of each destination's buffer, at least 65543
    #[clap(long, default_value_t = 128 * 1024)]
    buffer_size: usize,

    /// seconds after which a destination that does not accept pending data is disconnected
    #[clap(long, default_value_t = 10)]
    idle_timeout: u64,

    #[clap(long, default_value_t = 20)]
    poll_timeout_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = RelayConfig {
        bind_ip: args.ip,
        source_port: args.source_port,
        destination_port: args.destination_port,
        listen_backlog: args.backlog,
        max_destinations: args.max_destinations,
        source_buffer_size: args.buffer_size,
        destination_buffer_size: args.buffer_size,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        poll_timeout: Duration::from_millis(args.poll_timeout_millis),
    };

    let mut relay = match Relay::bind(config) {
        Ok(relay) => relay,
        Err(e) => {
            error!("failed to start relay: {:#}", e);
            return Err(e);
        }
    };

    spawn_interrupt_listener(relay.shutdown_handle())?;

    relay.run()?;
    info!("relay exiting");
    Ok(())
}

/// Waits for Ctrl-C on a separate thread and asks the relay to shut down when it arrives.
fn spawn_interrupt_listener(shutdown: ShutdownHandle) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("interrupt-listener".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("received interrupt");
                        shutdown.trigger();
                    }
                    Err(e) => error!("failed to listen for interrupt signal: {}", e),
                }
            })
        })?;
    Ok(())
}
