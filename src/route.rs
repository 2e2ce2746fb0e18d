//! Route registry: the parsed list of forwarding routes.
//!
//! A route maps one local listening port to one fixed backend host:port.
//! Routes come from positional command-line arguments of the form
//! `localPort:remoteHost:remotePort`; descriptors missing any of the three
//! fields are silently skipped. Routes are immutable after startup.

use mio::net::TcpListener;

// ============================================================================
// Route Specification
// ============================================================================

/// A parsed route descriptor, before its listener is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Local port to listen on.
    pub local_port: String,
    /// Backend host to forward to.
    pub host: String,
    /// Backend port to forward to.
    pub host_port: String,
}

impl RouteSpec {
    /// Parse one `localPort:remoteHost:remotePort` descriptor.
    ///
    /// Returns None if any of the three fields is missing or empty.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let mut parts = descriptor.splitn(3, ':');
        let local_port = parts.next().filter(|s| !s.is_empty())?;
        let host = parts.next().filter(|s| !s.is_empty())?;
        let host_port = parts.next().filter(|s| !s.is_empty())?;

        Some(RouteSpec {
            local_port: local_port.to_string(),
            host: host.to_string(),
            host_port: host_port.to_string(),
        })
    }
}

/// Parse a sequence of descriptors, skipping malformed ones.
pub fn parse_descriptors<'a, I>(descriptors: I) -> Vec<RouteSpec>
where
    I: IntoIterator<Item = &'a str>,
{
    descriptors
        .into_iter()
        .filter_map(RouteSpec::parse)
        .collect()
}

// ============================================================================
// Bound Route
// ============================================================================

/// A route whose listener has been bound and registered.
///
/// The listener's mio token is the route's index in the registry, so an
/// event on a listener token maps back to its route by plain indexing.
#[derive(Debug)]
pub struct Route {
    pub spec: RouteSpec,
    pub listener: TcpListener,
}

impl Route {
    pub fn new(spec: RouteSpec, listener: TcpListener) -> Self {
        Route { spec, listener }
    }

    /// Human-readable `localPort -> host:hostPort` form for logs.
    pub fn describe(&self) -> String {
        format!(
            "{} -> {}:{}",
            self.spec.local_port, self.spec.host, self.spec.host_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed() {
        let spec = RouteSpec::parse("9000:127.0.0.1:9001").unwrap();
        assert_eq!(spec.local_port, "9000");
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.host_port, "9001");
    }

    #[test]
    fn test_parse_missing_fields() {
        assert_eq!(RouteSpec::parse("9000"), None);
        assert_eq!(RouteSpec::parse("9000:host"), None);
        assert_eq!(RouteSpec::parse(""), None);
        assert_eq!(RouteSpec::parse("9000::9001"), None);
        assert_eq!(RouteSpec::parse(":host:9001"), None);
    }

    #[test]
    fn test_malformed_descriptors_do_not_shift_count() {
        let routes = parse_descriptors([
            "8080:example.com:80",
            "bogus",
            "8443:example.com:443",
            "also:bogus",
        ]);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].local_port, "8080");
        assert_eq!(routes[1].local_port, "8443");
    }
}
