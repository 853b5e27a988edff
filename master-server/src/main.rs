//! Game rendezvous ("master") server
//!
//! A server that:
//! - Accepts registrations from game servers and keeps them listed while
//!   they refresh
//! - Hands clients the current server list
//! - Coordinates NAT hole punching by queueing punch candidates for their
//!   target servers
//!
//! All state is in memory and rebuilt from scratch on restart.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use master_server::metrics::Metrics;
use master_server::server::MasterServer;
use master_server::transport::{self, QuicTransport};

/// Default server port
const DEFAULT_PORT: u16 = 5902;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let port = if args.len() > 1 {
        args[1].parse().unwrap_or(DEFAULT_PORT)
    } else {
        DEFAULT_PORT
    };

    let cert_path = args.get(2).map(|s| s.as_str()).unwrap_or("certs/cert.pem");
    let key_path = args.get(3).map(|s| s.as_str()).unwrap_or("certs/key.pem");

    log::info!("master server starting...");
    log::info!("  Port: {}", port);
    log::info!("  Cert: {}", cert_path);
    log::info!("  Key:  {}", key_path);
    log::info!("  ALPN: {:?}", std::str::from_utf8(transport::ALPN_PROTOCOL));

    // transport creation is the only fatal failure; everything after this
    // point is scoped to the offending connection
    let transport = QuicTransport::new(port, cert_path, key_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let metrics = Arc::new(Metrics::new());
    let mut master = MasterServer::new(transport, Arc::clone(&metrics));
    master.run(&shutdown)?;

    log::info!("shutting down; final metrics:\n{}", metrics.render());
    Ok(())
}
