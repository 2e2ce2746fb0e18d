//! Socket factory: non-blocking listeners and backend connects.
//!
//! Both paths resolve their target through `ToSocketAddrs` and try each
//! candidate address in order. mio's TCP types are created non-blocking, and
//! `TcpStream::connect` issues a non-blocking connect where "in progress" is
//! success; connect completion shows up later as the stream's first writable
//! edge, and a connect that ultimately fails surfaces as a read/write error
//! that tears the connection down.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::{TcpListener, TcpStream};

fn parse_port(port: &str) -> io::Result<u16> {
    port.parse::<u16>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid port '{}'", port),
        )
    })
}

fn resolve(host: &str, port: &str) -> io::Result<Vec<SocketAddr>> {
    let port = parse_port(port)?;
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}:{}", host, port),
        ));
    }
    Ok(addrs)
}

/// Bind a non-blocking listener on the given local port.
///
/// Tried against every resolved candidate in order; the error of the last
/// failed candidate is returned if none binds. Failures here are
/// startup-fatal and propagate out of server construction.
pub fn bind_listener(port: &str) -> io::Result<TcpListener> {
    let mut last_err = None;

    for addr in resolve("0.0.0.0", port)? {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                log::debug!("bind {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "bind failed")))
}

/// Open a non-blocking connect to the backend.
///
/// An in-progress connect is success. Total failure (every candidate refused
/// outright) is an error for this one connection attempt only; the caller
/// drops the accepted client socket and carries on.
pub fn connect_backend(host: &str, port: &str) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in resolve(host, port)? {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("connect {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "connect failed")))
}
