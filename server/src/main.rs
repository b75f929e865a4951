use clap::Parser;
use log::info;
use server::network::{ReceivedPayload, Server, ServerConfig, DEFAULT_PROTOCOL_ID};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "40000")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// Maximum number of concurrent clients
    #[clap(short, long, default_value = "64")]
    max_clients: usize,
    /// Protocol id shared with clients, decimal or 0x-prefixed hex
    #[clap(long, value_parser = parse_protocol_id)]
    protocol_id: Option<u64>,
    /// Seconds without traffic before a client is dropped
    #[clap(long, default_value = "5")]
    timeout: u64,
}

fn parse_protocol_id(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid protocol id '{}': {}", value, e))
}

/// Main-method of the application.
/// Parses command-line arguments, then runs the server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.tick_rate == 0 {
        return Err("tick rate must be at least 1".into());
    }

    let config = ServerConfig {
        protocol_id: args.protocol_id.unwrap_or(DEFAULT_PROTOCOL_ID),
        max_clients: args.max_clients,
        tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate as f64),
        timeout: Duration::from_secs(args.timeout),
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config).await?;

    if let Some(mut payloads) = server.take_payloads() {
        tokio::spawn(async move {
            while let Some(ReceivedPayload { client_index, data }) = payloads.recv().await {
                info!("Payload of {} bytes from slot {}", data.len(), client_index);
            }
        });
    }

    let clients = server.clients();
    let clock = server.clock();

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            clients.disconnect_all(clock.now());
        }
    }

    Ok(())
}
