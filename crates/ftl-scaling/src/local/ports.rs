use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// A currently free TCP port on the loopback interface.
///
/// The port is released before returning, so another process can still
/// take it before the runner binds it.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
