//! Entry point for the `rudp` demo programs.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  The client generates a random payload, announces it with a
//! 5-byte `READY` preamble, sends it, and reports the elapsed time; the
//! server receives messages until the client disconnects and prints a
//! throughput summary.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup and reporting.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rudp::{Config, Connection, Role};

/// Default payload size for the client: 2 MiB.
const PAYLOAD_SIZE_DEFAULT: usize = 2 * 1024 * 1024;

/// Server-side receive buffer; larger client payloads are truncated.
const RECV_CAPACITY: usize = 64 * 1024 * 1024;

/// Reliable message transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// MTU in bytes (negotiated down to the smaller of the two peers).
    #[arg(long, default_value_t = rudp::connection::MTU_DEFAULT)]
    mtu: u16,

    /// ACK timeout in milliseconds.
    #[arg(long, default_value_t = rudp::connection::TIMEOUT_DEFAULT_MS)]
    timeout: u16,

    /// Retry budget per fragment.
    #[arg(long, default_value_t = rudp::connection::MAX_RETRIES_DEFAULT)]
    retries: u16,

    /// Log per-transfer statistics.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for one peer and receive its messages.
    Server {
        /// Local port to listen on.
        #[arg(short, long)]
        port: u16,
    },
    /// Connect to a server and send it data.
    Client {
        /// Server IP address.
        #[arg(long)]
        ip: IpAddr,

        /// Server port.
        #[arg(short, long)]
        port: u16,

        /// Payload size in bytes.
        #[arg(long, default_value_t = PAYLOAD_SIZE_DEFAULT)]
        size: usize,

        /// How many times to send the payload.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        mtu: cli.mtu,
        timeout_ms: cli.timeout,
        max_retries: cli.retries,
        debug: cli.debug,
    };

    match cli.mode {
        Mode::Server { port } => run_server(port, config).await,
        Mode::Client {
            ip,
            port,
            size,
            count,
        } => run_client(SocketAddr::new(ip, port), size, count, config).await,
    }
}

async fn run_server(port: u16, config: Config) -> Result<()> {
    let mut conn = Connection::open(Role::Listener, port, config).await?;
    println!("Listening on {}", conn.local_addr());

    conn.accept().await?;

    let mut payload = vec![0u8; RECV_CAPACITY];
    let mut ready = [0u8; 5];
    let mut samples: Vec<(usize, f64)> = Vec::new();

    loop {
        // Each round opens with a READY preamble, then the payload itself.
        let n = conn.recv(&mut ready).await?;
        if n == 0 {
            break;
        }
        if &ready[..n] != b"READY" {
            eprintln!("Unexpected preamble, ignoring round");
            continue;
        }

        let start = Instant::now();
        let bytes = conn.recv(&mut payload).await?;
        let elapsed = start.elapsed();
        if bytes == 0 {
            break;
        }

        let ms = elapsed.as_secs_f64() * 1000.0;
        println!("Received {bytes} bytes in {ms:.2} ms");
        samples.push((bytes, ms));
    }

    if samples.is_empty() {
        println!("No data received.");
        return Ok(());
    }

    let total_ms: f64 = samples.iter().map(|(_, ms)| ms).sum();
    let total_bytes: usize = samples.iter().map(|(b, _)| b).sum();
    let mbps = (total_bytes as f64 * 8.0) / 1024.0 / 1024.0 / (total_ms / 1000.0);
    println!("Rounds: {}", samples.len());
    println!("Total: {total_bytes} bytes in {total_ms:.2} ms");
    println!("Average throughput: {mbps:.2} Mbps");

    Ok(())
}

async fn run_client(server: SocketAddr, size: usize, count: u32, config: Config) -> Result<()> {
    let mut conn = Connection::open(Role::Initiator, 0, config).await?;

    println!("Generating {size} bytes of random data...");
    let mut rng = StdRng::from_entropy();
    let mut payload = vec![0u8; size];
    rng.fill(payload.as_mut_slice());

    println!("Connecting to {server}...");
    conn.connect(server).await?;

    for round in 1..=count {
        println!("Sending {size} bytes ({round}/{count})...");

        let sent = conn.send(b"READY").await?;
        if sent == 0 {
            bail!("server closed the connection before the preamble");
        }

        let start = Instant::now();
        let sent = conn.send(&payload).await?;
        let elapsed = start.elapsed();
        if sent == 0 {
            bail!("server closed the connection mid-transfer");
        }

        println!(
            "Sent {sent} bytes in {:.2} ms",
            elapsed.as_secs_f64() * 1000.0
        );
    }

    conn.disconnect().await?;
    Ok(())
}
