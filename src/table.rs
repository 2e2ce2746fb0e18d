//! Bounded connection table.
//!
//! A fixed-capacity array of slots. Slots `[0, route_count)` are reserved so
//! that slot index and listener token never collide; the pool available for
//! live connections is `[route_count, capacity)`. Allocation is a linear
//! first-empty scan and iteration skips empty slots, both O(capacity), which is fine
//! because the capacity is small and bounded.
//!
//! Tokens are arithmetic: a listener's token is its route index, and a
//! connection's two streams get `capacity + slot * 2 + leg`. Decoding a token
//! back to (slot, leg) is constant-time, so readiness events never scan.

use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Registry, Token};

use crate::buffer::RelayBuffer;

// ============================================================================
// Readiness Roles
// ============================================================================

/// Indices into a connection's readiness-flag vector.
pub const LOCAL_READ: usize = 0;
pub const LOCAL_WRITE: usize = 1;
pub const REMOTE_READ: usize = 2;
pub const REMOTE_WRITE: usize = 3;

/// Which of a connection's two streams a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The accepted client-facing stream.
    Local = 0,
    /// The backend-facing stream.
    Remote = 1,
}

// ============================================================================
// Connection
// ============================================================================

/// One active proxied stream: a client-facing leg, a backend-facing leg,
/// four readiness flags, and one single-chunk buffer per direction.
#[derive(Debug)]
pub struct Connection {
    /// Accepted client socket.
    pub local: TcpStream,
    /// Backend socket (non-blocking connect, possibly still in progress).
    pub remote: TcpStream,
    /// Readiness flags, indexed by LOCAL_READ..REMOTE_WRITE.
    ///
    /// Freshly created connections start with both write flags unset; the
    /// first writable edge after registration sets them (for the backend leg
    /// that edge doubles as connect completion).
    pub ready: [bool; 4],
    /// Index of the owning route.
    pub route: usize,
    /// Peer address of the accepted client, for logs.
    pub peer: SocketAddr,
    /// `buffers[0]` carries remote -> local, `buffers[1]` local -> remote.
    pub buffers: [RelayBuffer; 2],
}

impl Connection {
    pub fn new(local: TcpStream, remote: TcpStream, route: usize, peer: SocketAddr) -> Self {
        Connection {
            local,
            remote,
            ready: [false; 4],
            route,
            peer,
            buffers: [RelayBuffer::new(), RelayBuffer::new()],
        }
    }
}

// ============================================================================
// Connection Table
// ============================================================================

/// Fixed-capacity slot array with a live-connection counter.
///
/// Invariant: the number of occupied pool slots equals `live` at all times,
/// and slots below `first_pool` are never occupied.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    first_pool: usize,
    live: usize,
}

impl ConnectionTable {
    /// `route_count` slots are reserved; the rest form the pool.
    pub fn new(capacity: usize, route_count: usize) -> Self {
        assert!(
            route_count < capacity,
            "route count {} must be below capacity {}",
            route_count,
            capacity
        );

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        ConnectionTable {
            slots,
            first_pool: route_count,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First pool slot index (== number of reserved listener slots).
    pub fn first_pool(&self) -> usize {
        self.first_pool
    }

    /// Number of live connections.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Token for one leg of the connection in `slot`.
    pub fn token(&self, slot: usize, leg: Leg) -> Token {
        Token(self.capacity() + slot * 2 + leg as usize)
    }

    /// Map a token back to (slot, leg). Listener tokens (below capacity)
    /// return None.
    pub fn decode(&self, token: Token) -> Option<(usize, Leg)> {
        let raw = token.0.checked_sub(self.capacity())?;
        let slot = raw / 2;
        if slot >= self.capacity() {
            return None;
        }
        let leg = if raw % 2 == 0 { Leg::Local } else { Leg::Remote };
        Some((slot, leg))
    }

    /// First empty pool slot, or None when the pool is exhausted.
    pub fn find_empty(&self) -> Option<usize> {
        (self.first_pool..self.slots.len()).find(|&i| self.slots[i].is_none())
    }

    /// Place a connection into a previously empty slot.
    pub fn occupy(&mut self, slot: usize, conn: Connection) {
        debug_assert!(slot >= self.first_pool);
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(conn);
        self.live += 1;
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn is_live(&self, slot: usize) -> bool {
        self.slots.get(slot).map_or(false, |s| s.is_some())
    }

    /// Tear down the connection in `slot`: deregister both streams, close
    /// them, reset the slot to empty and decrement the live counter.
    ///
    /// Must only be called on a live slot.
    pub fn release(&mut self, registry: &Registry, slot: usize, route_desc: &str) {
        let mut conn = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.take())
            .expect("release of empty slot");

        if let Err(e) = registry.deregister(&mut conn.local) {
            log::warn!("deregister local leg of slot {}: {}", slot, e);
        }
        if let Err(e) = registry.deregister(&mut conn.remote) {
            log::warn!("deregister remote leg of slot {}: {}", slot, e);
        }

        self.live -= 1;

        log::info!(
            "Closed connection from {} on {} (slot {}, {} live)",
            conn.peer,
            route_desc,
            slot,
            self.live
        );

        // Streams close when conn drops here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Interest, Poll};

    /// A connected non-blocking stream pair over loopback.
    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = std::net::TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (TcpStream::from_std(a), TcpStream::from_std(b))
    }

    fn test_connection(route: usize) -> Connection {
        let (local, _keep_local) = stream_pair();
        let (remote, _keep_remote) = stream_pair();
        // Leak the far ends so the near ends stay open for the test's
        // lifetime; the OS reclaims them at process exit.
        std::mem::forget(_keep_local);
        std::mem::forget(_keep_remote);
        let peer = local.peer_addr().unwrap();
        Connection::new(local, remote, route, peer)
    }

    #[test]
    fn test_allocate_to_exhaustion() {
        let mut table = ConnectionTable::new(4, 1);
        assert_eq!(table.first_pool(), 1);

        // Pool is slots 1..4.
        for expect in 1..4 {
            let slot = table.find_empty().unwrap();
            assert_eq!(slot, expect);
            table.occupy(slot, test_connection(0));
        }

        assert_eq!(table.live(), 3);
        assert_eq!(table.find_empty(), None);
    }

    #[test]
    fn test_release_frees_slot_for_reuse() {
        let poll = Poll::new().unwrap();
        let registry = poll.registry();
        let mut table = ConnectionTable::new(4, 1);

        let slot = table.find_empty().unwrap();
        let mut conn = test_connection(0);
        registry
            .register(
                &mut conn.local,
                table.token(slot, Leg::Local),
                Interest::READABLE | Interest::WRITABLE,
            )
            .unwrap();
        registry
            .register(
                &mut conn.remote,
                table.token(slot, Leg::Remote),
                Interest::READABLE | Interest::WRITABLE,
            )
            .unwrap();
        table.occupy(slot, conn);
        assert_eq!(table.live(), 1);
        assert!(table.is_live(slot));

        table.release(registry, slot, "test-route");
        assert_eq!(table.live(), 0);
        assert!(!table.is_live(slot));
        assert_eq!(table.find_empty(), Some(slot));
    }

    #[test]
    fn test_reserved_region_never_allocated() {
        let mut table = ConnectionTable::new(8, 3);
        while let Some(slot) = table.find_empty() {
            assert!(slot >= 3);
            table.occupy(slot, test_connection(0));
        }
        assert_eq!(table.live(), 5);
    }

    #[test]
    fn test_token_round_trip() {
        let table = ConnectionTable::new(1024, 2);

        for slot in [2usize, 3, 512, 1023] {
            for leg in [Leg::Local, Leg::Remote] {
                let token = table.token(slot, leg);
                assert_eq!(table.decode(token), Some((slot, leg)));
            }
        }

        // Listener tokens are below capacity and never decode as connections.
        assert_eq!(table.decode(Token(0)), None);
        assert_eq!(table.decode(Token(1023)), None);
    }
}
