use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

/// Creates a non-blocking listening socket with an explicit backlog, which `mio`'s own
///  `TcpListener::bind` does not allow configuring.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // NB: this allows restarting the relay while connections of the previous process are still
    //  in TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener = TcpListener::from_std(socket.into());
    info!("listening on {:?}", listener.local_addr()?);
    Ok(listener)
}
