//! Multi-listener TCP forwarder.
//!
//! Each configured route binds one local port and relays every accepted
//! connection to a fixed backend host:port. All listeners and all proxied
//! streams are driven by a single mio poll loop on one thread; a bounded
//! connection table caps the number of simultaneous streams.

pub mod buffer;
pub mod metrics;
pub mod relay;
pub mod route;
pub mod server;
pub mod socket;
pub mod table;
