//! mqlink - TCP Connection Layer for a Message Broker
//!
//! This is the main entry point for the mqlink server.
//! It parses the configuration, starts the reactors and echoes every byte it
//! receives until Ctrl+C.

use anyhow::Context as _;
use mqlink::{Command, Config, EchoCodec, Server};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!(
        r#"
mqlink - TCP Connection Layer for a Message Broker

USAGE:
    mqlink [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>          Port to listen on (default: 1883)
        --io-threads <N>       Number of io reactor threads (default: CPU count)
        --read-hint <BYTES>    Bytes requested per socket read (default: 4096)
        --no-delay             Set TCP_NODELAY on accepted sockets
        --log-level <LEVEL>    trace, debug, info, warn or error (default: info)
    -v, --version              Print version information
        --help                 Print this help message

EXAMPLES:
    mqlink                         # Start on 127.0.0.1:1883
    mqlink --port 1884             # Start on port 1884
    mqlink --io-threads 2          # Two io groups

    RUST_LOG overrides --log-level:
    $ RUST_LOG=mqlink=trace mqlink
"#
    );
}

fn print_banner(config: &Config, addr: SocketAddr) {
    println!(
        r#"
mqlink v{}
──────────────────────────────────────────────────────────────
Listening on {} with {} io thread(s)
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        mqlink::VERSION,
        addr,
        config.io_threads
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = match Config::parse(std::env::args().skip(1)) {
        Ok(Command::Run(config)) => config,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("mqlink version {}", mqlink::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    // The reactors run on their own threads; tokio only waits for the signal
    let server = Server::start(&config, Arc::new(EchoCodec))?;
    print_banner(&config, server.local_addr());

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    let stats = server.stats();
    tokio::task::spawn_blocking(move || server.shutdown()).await?;

    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        bytes_read = stats.bytes_read.load(Ordering::Relaxed),
        bytes_written = stats.bytes_written.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
