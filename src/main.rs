//! multiproxy
//!
//! A multi-listener TCP forwarder: every `localPort:remoteHost:remotePort`
//! descriptor on the command line becomes one listening port whose accepted
//! connections are relayed to the given backend. A single thread and a single
//! mio poll drive all routes and all connections.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use multiproxy::route;
use multiproxy::server::{Server, DEFAULT_MAX_CONNECTIONS};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() == 1 {
        println!("Usage:");
        println!(
            "\t{} [--max-connections N] local_port:host:host_port ...",
            args[0]
        );
        return Ok(());
    }

    let max_connections = match parse_arg(&args, "--max-connections") {
        Some(v) => v.parse::<usize>().map_err(|_| "invalid --max-connections")?,
        None => DEFAULT_MAX_CONNECTIONS,
    };
    if max_connections < 2 {
        return Err("--max-connections must be at least 2".into());
    }

    // Everything that is not a flag (or a flag's value) is a route
    // descriptor; malformed descriptors are silently skipped.
    let mut descriptors = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        if arg == "--max-connections" {
            iter.next();
            continue;
        }
        descriptors.push(arg.as_str());
    }

    let routes = route::parse_descriptors(descriptors);

    log::info!("multiproxy starting...");
    log::info!("  Routes:   {}", routes.len());
    log::info!("  Capacity: {}", max_connections);

    if routes.len() >= max_connections {
        log::error!(
            "Too many routes! Loaded: {}, limit: {}",
            routes.len(),
            max_connections - 1
        );
        return Err("route count exceeds pool capacity".into());
    }

    // SIGINT/SIGTERM flip the flag; the event loop notices within one poll
    // timeout and shuts down cleanly.
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(routes, max_connections)?;
    server.run(&shutdown)?;

    log::info!("multiproxy stopped");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
