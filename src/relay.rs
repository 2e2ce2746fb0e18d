//! Half-duplex relay: the one place bytes move.
//!
//! Each invocation drains the source stream into the destination stream
//! through the direction's single-chunk buffer. The loop never blocks and
//! never spins: when the OS reports WouldBlock the relevant readiness flag is
//! cleared and the loop returns, waiting for the next edge. A partial write
//! also clears the write flag and returns: under edge-triggered readiness
//! the destination must not be retried until the next writable notification.
//!
//! EOF on the source, a zero-length write, or any other I/O error signals
//! `Closed`: the caller tears down the whole bidirectional connection. There
//! is no half-close support.

use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;

use crate::metrics::Metrics;
use crate::table::{Connection, LOCAL_READ, LOCAL_WRITE, REMOTE_READ, REMOTE_WRITE};

/// One relay direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    /// (source read flag, destination write flag) for this direction.
    pub fn flags(self) -> (usize, usize) {
        match self {
            Direction::LocalToRemote => (LOCAL_READ, REMOTE_WRITE),
            Direction::RemoteToLocal => (REMOTE_READ, LOCAL_WRITE),
        }
    }

    /// Index of this direction's buffer in `Connection::buffers`.
    pub fn buffer_index(self) -> usize {
        match self {
            Direction::LocalToRemote => 1,
            Direction::RemoteToLocal => 0,
        }
    }
}

/// What the driver should do with the connection after a relay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Connection stays up; readiness flags were updated.
    Open,
    /// EOF or unrecoverable I/O error: release the slot.
    Closed,
}

impl Connection {
    /// Drain one direction until the source or destination would block.
    ///
    /// The driver invokes this only when the source is flagged readable and
    /// the destination writable. Teardown itself is left to the caller, which
    /// owns the poll registry.
    pub fn relay(&mut self, dir: Direction, metrics: &Metrics) -> RelayOutcome {
        let (rd, wr) = dir.flags();
        let (src, dst) = match dir {
            Direction::LocalToRemote => (&mut self.local, &mut self.remote),
            Direction::RemoteToLocal => (&mut self.remote, &mut self.local),
        };
        let buf = &mut self.buffers[dir.buffer_index()];
        let bytes_counter = match dir {
            Direction::LocalToRemote => &metrics.bytes_out_total,
            Direction::RemoteToLocal => &metrics.bytes_in_total,
        };

        loop {
            while !buf.is_empty() {
                let want = buf.pending().len();
                match dst.write(buf.pending()) {
                    Ok(0) => {
                        log::debug!("write end closed for {} ({:?})", self.peer, dir);
                        return RelayOutcome::Closed;
                    }
                    Ok(n) if n == want => {
                        buf.consume(n);
                        bytes_counter.fetch_add(n as u64, Ordering::Relaxed);
                        // Chunk fully forwarded; fall through to read more.
                    }
                    Ok(n) => {
                        // Partial write: keep the remainder and wait for the
                        // next writable edge.
                        buf.consume(n);
                        bytes_counter.fetch_add(n as u64, Ordering::Relaxed);
                        self.ready[wr] = false;
                        return RelayOutcome::Open;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.ready[wr] = false;
                        return RelayOutcome::Open;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("write error for {} ({:?}): {}", self.peer, dir, e);
                        return RelayOutcome::Closed;
                    }
                }
            }

            match src.read(buf.writable()) {
                Ok(0) => {
                    // Peer closed its write side; the whole connection goes.
                    return RelayOutcome::Closed;
                }
                Ok(n) => {
                    buf.fill(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready[rd] = false;
                    return RelayOutcome::Open;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("read error for {} ({:?}): {}", self.peer, dir, e);
                    return RelayOutcome::Closed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    /// (mio near end, std far end) connected over loopback.
    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let far = std::net::TcpStream::connect(addr).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        (TcpStream::from_std(near), far)
    }

    fn test_connection() -> (Connection, std::net::TcpStream, std::net::TcpStream) {
        let (local, client) = stream_pair();
        let (remote, backend) = stream_pair();
        let peer = local.peer_addr().unwrap();
        (Connection::new(local, remote, 0, peer), client, backend)
    }

    fn arm(conn: &mut Connection) {
        conn.ready = [true; 4];
    }

    #[test]
    fn test_relay_forwards_bytes() {
        let (mut conn, mut client, mut backend) = test_connection();
        let metrics = Metrics::new();

        client.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(50));

        arm(&mut conn);
        assert_eq!(conn.relay(Direction::LocalToRemote, &metrics), RelayOutcome::Open);
        // Source drained until WouldBlock, so its read flag is cleared.
        assert!(!conn.ready[LOCAL_READ]);

        let mut got = [0u8; 4];
        backend.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
        assert_eq!(metrics.bytes_out_total.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_relay_reverse_direction() {
        let (mut conn, mut client, mut backend) = test_connection();
        let metrics = Metrics::new();

        backend.write_all(b"pong").unwrap();
        thread::sleep(Duration::from_millis(50));

        arm(&mut conn);
        assert_eq!(conn.relay(Direction::RemoteToLocal, &metrics), RelayOutcome::Open);

        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");
    }

    #[test]
    fn test_eof_closes_connection() {
        let (mut conn, client, _backend) = test_connection();
        let metrics = Metrics::new();

        drop(client);
        thread::sleep(Duration::from_millis(50));

        arm(&mut conn);
        assert_eq!(conn.relay(Direction::LocalToRemote, &metrics), RelayOutcome::Closed);
    }

    /// Push enough data through a stalled-then-drained backend to force
    /// partial writes and WouldBlock, then verify every byte arrives intact
    /// and in order.
    #[test]
    fn test_no_loss_or_duplication_across_blocking() {
        const TOTAL: usize = 8 * 1024 * 1024;

        let (mut conn, client, mut backend) = test_connection();
        let metrics = Metrics::new();
        backend.set_nonblocking(true).unwrap();

        let writer = thread::spawn(move || {
            let mut client = client;
            let chunk: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
            let mut sent = 0;
            while sent < TOTAL {
                let n = (TOTAL - sent).min(chunk.len());
                client.write_all(&chunk[..n]).unwrap();
                sent += n;
            }
            // Dropping the stream closes it, producing EOF downstream.
        });

        let mut received = Vec::with_capacity(TOTAL);
        let mut scratch = [0u8; 65536];
        let mut iterations = 0;

        loop {
            iterations += 1;
            assert!(iterations < 100_000, "relay made no progress");

            arm(&mut conn);
            let outcome = conn.relay(Direction::LocalToRemote, &metrics);

            // Drain whatever reached the backend side.
            loop {
                match backend.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&scratch[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("backend read: {}", e),
                }
            }

            if outcome == RelayOutcome::Closed {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        writer.join().unwrap();

        // The relay saw EOF only after forwarding everything, but the tail of
        // the data may still be in flight in the backend's receive buffer.
        while received.len() < TOTAL {
            match backend.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("backend read: {}", e),
            }
        }

        assert_eq!(received.len(), TOTAL);
        for (i, &b) in received.iter().enumerate() {
            assert_eq!(b, ((i % 65536) % 251) as u8, "byte {} corrupted", i);
        }
    }
}
