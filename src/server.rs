//! The event loop driver.
//!
//! One mio `Poll` on one thread drives everything: listener readiness turns
//! into accepts, stream readiness turns into relay passes. Per wait cycle the
//! order is fixed: drain events into readiness flags, process all pending
//! accepts, then walk the live connections in ascending slot order and relay
//! each direction whose source is readable and destination writable.
//!
//! Poll failure is fatal (multiplexer corruption); `Interrupted` is signal
//! delivery and re-enters the loop. Everything that goes wrong on a single
//! connection is consumed here: the slot is released and the loop carries on.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::metrics::Metrics;
use crate::relay::{Direction, RelayOutcome};
use crate::route::{Route, RouteSpec};
use crate::socket;
use crate::table::{ConnectionTable, Connection, Leg, LOCAL_READ, LOCAL_WRITE, REMOTE_READ, REMOTE_WRITE};

/// Default bounded-pool capacity (listener slots included).
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Events drained per poll wait.
const EVENTS_CAPACITY: usize = 1024;

/// Poll timeout, so the shutdown flag is observed promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Server
// ============================================================================

#[derive(Debug)]
pub struct Server {
    poll: Poll,
    events: Events,
    routes: Vec<Route>,
    table: ConnectionTable,
    metrics: Metrics,
    /// Per-route accept flags, set in phase 1 and consumed in phase 2.
    acceptable: Vec<bool>,
}

impl Server {
    /// Bind and register a listener for every route.
    ///
    /// Fails (startup-fatal) if the route count reaches the pool capacity,
    /// or if any bind or registration fails.
    pub fn new(specs: Vec<RouteSpec>, max_connections: usize) -> io::Result<Self> {
        if specs.len() >= max_connections {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "too many routes: loaded {}, limit {}",
                    specs.len(),
                    max_connections - 1
                ),
            ));
        }

        let poll = Poll::new()?;
        let mut routes = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            let mut listener = socket::bind_listener(&spec.local_port)?;
            poll.registry()
                .register(&mut listener, Token(index), Interest::READABLE)?;

            let route = Route::new(spec, listener);
            log::info!(
                "Listening on {} for {}",
                route.listener.local_addr()?,
                route.describe()
            );
            routes.push(route);
        }

        let table = ConnectionTable::new(max_connections, routes.len());
        let acceptable = vec![false; routes.len()];

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            routes,
            table,
            metrics: Metrics::new(),
            acceptable,
        })
    }

    /// Actual bound address of a route's listener (useful with port 0).
    pub fn listener_addr(&self, route: usize) -> io::Result<SocketAddr> {
        self.routes[route].listener.local_addr()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn live_connections(&self) -> usize {
        self.table.live()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run the event loop until the shutdown flag is set.
    ///
    /// Returns an error only on multiplexer failure; connection-level errors
    /// never propagate out of the loop.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        log::info!(
            "Event loop running: {} routes, pool capacity {}",
            self.routes.len(),
            self.table.capacity() - self.table.first_pool()
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(Some(POLL_TIMEOUT))?;
        }

        self.shutdown();
        Ok(())
    }

    /// One wait cycle: wait for events, mark readiness, accept, relay.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // Signal delivery, not multiplexer corruption.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        // Phase 1: turn events into readiness flags.
        for event in self.events.iter() {
            let token = event.token();
            if token.0 < self.routes.len() {
                self.acceptable[token.0] = true;
            } else if let Some((slot, leg)) = self.table.decode(token) {
                if let Some(conn) = self.table.get_mut(slot) {
                    let (rd, wr) = match leg {
                        Leg::Local => (LOCAL_READ, LOCAL_WRITE),
                        Leg::Remote => (REMOTE_READ, REMOTE_WRITE),
                    };
                    if event.is_readable() {
                        conn.ready[rd] = true;
                    }
                    if event.is_writable() {
                        conn.ready[wr] = true;
                    }
                }
            }
        }

        // Phase 2: all accepts before any relay I/O.
        for route in 0..self.routes.len() {
            if self.acceptable[route] {
                self.acceptable[route] = false;
                self.accept_pending(route);
            }
        }

        // Phase 3: relay every ready direction, ascending slot order.
        self.relay_ready();

        Ok(())
    }

    /// Accept from a ready listener until it would block.
    ///
    /// Listeners are edge-triggered like everything else under mio, so a
    /// single accept per notification could strand backlogged connections;
    /// the loop drains the backlog instead.
    fn accept_pending(&mut self, route: usize) {
        loop {
            let (local, peer) = match self.routes[route].listener.accept() {
                Ok(v) => v,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept on {} failed: {}", self.routes[route].describe(), e);
                    return;
                }
            };
            self.admit(route, local, peer);
        }
    }

    /// Take one accepted client through admission: pool slot, backend
    /// connect, registration of both legs.
    ///
    /// Any failure closes the client socket and leaves the table untouched;
    /// a slot is either fully registered or never occupied.
    fn admit(&mut self, route: usize, mut local: TcpStream, peer: SocketAddr) {
        self.metrics.accepted_total.fetch_add(1, Ordering::Relaxed);

        let slot = match self.table.find_empty() {
            Some(slot) => slot,
            None => {
                // The only backpressure mechanism: drop the connection.
                self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Dropped connection from {} to {} (pool full)",
                    peer,
                    self.routes[route].describe()
                );
                return;
            }
        };

        let spec = &self.routes[route].spec;
        let mut remote = match socket::connect_backend(&spec.host, &spec.host_port) {
            Ok(stream) => stream,
            Err(e) => {
                self.metrics
                    .connect_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "backend connect for {} failed: {}",
                    self.routes[route].describe(),
                    e
                );
                return;
            }
        };

        let registry = self.poll.registry();
        let both = Interest::READABLE | Interest::WRITABLE;
        let local_token = self.table.token(slot, Leg::Local);
        let remote_token = self.table.token(slot, Leg::Remote);

        if let Err(e) = registry.register(&mut local, local_token, both) {
            log::warn!("register local leg failed: {}", e);
            return;
        }
        if let Err(e) = registry.register(&mut remote, remote_token, both) {
            let _ = registry.deregister(&mut local);
            log::warn!("register remote leg failed: {}", e);
            return;
        }

        log::info!(
            "New connection from {} to {} (slot {}, tokens {}/{})",
            peer,
            self.routes[route].describe(),
            slot,
            local_token.0,
            remote_token.0
        );

        self.table.occupy(slot, Connection::new(local, remote, route, peer));
    }

    /// One relay pass over the pool, stopping early once every live
    /// connection has been visited.
    fn relay_ready(&mut self) {
        let live = self.table.live();
        let mut visited = 0;

        for slot in self.table.first_pool()..self.table.capacity() {
            if visited == live {
                break;
            }

            let Some(conn) = self.table.get_mut(slot) else {
                continue;
            };
            visited += 1;

            if conn.ready[LOCAL_READ] && conn.ready[REMOTE_WRITE] {
                if conn.relay(Direction::LocalToRemote, &self.metrics) == RelayOutcome::Closed {
                    self.release(slot);
                    continue;
                }
            }

            // The first direction may have torn the slot down.
            if let Some(conn) = self.table.get_mut(slot) {
                if conn.ready[REMOTE_READ] && conn.ready[LOCAL_WRITE] {
                    if conn.relay(Direction::RemoteToLocal, &self.metrics) == RelayOutcome::Closed {
                        self.release(slot);
                    }
                }
            }
        }
    }

    fn release(&mut self, slot: usize) {
        let route = self
            .table
            .get_mut(slot)
            .map(|c| c.route)
            .expect("release of empty slot");
        let desc = self.routes[route].describe();
        self.table.release(self.poll.registry(), slot, &desc);
        self.metrics.closed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Release every live connection and log the final counters.
    pub fn shutdown(&mut self) {
        let live = self.table.live();
        if live > 0 {
            log::info!("Shutting down: releasing {} live connections", live);
        }

        for slot in self.table.first_pool()..self.table.capacity() {
            if self.table.is_live(slot) {
                self.release(slot);
            }
        }

        log::info!("Final metrics:\n{}", self.metrics.render());
    }
}
