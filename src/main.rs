//! AKARI-UDP daemon binary.
//!
//! `serve` runs the responder engine with a built-in demo fetcher so a
//! tunnel pair can be exercised without the HTTP-side plumbing; `fetch`
//! performs a one-shot request against a running responder and prints the
//! outcome.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use akari_udp::fetch::{FetchError, FetchedResponse, Fetcher};
use akari_udp::{AkariClient, AkariServer, Config, RequestMethod};

/// AKARI-UDP tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "akari-udp", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Pre-shared key as UTF-8 text (overrides config)
    #[arg(long, value_name = "KEY")]
    psk: Option<String>,

    /// Pre-shared key as hex (overrides config and --psk)
    #[arg(long, value_name = "HEX")]
    psk_hex: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the responder with the built-in demo fetcher
    Serve,
    /// Fetch one URL through a running responder and print the outcome
    Fetch {
        /// Target URL; `demo://bytes/N` asks the demo fetcher for N bytes
        url: String,
        /// Responder host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Responder port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Decode a captured datagram and print its fields
    Inspect {
        /// File holding the raw datagram bytes
        #[arg(value_name = "FILE", conflicts_with = "hex")]
        file: Option<PathBuf>,
        /// Datagram as a hex string instead of a file
        #[arg(long, value_name = "HEX")]
        hex: Option<String>,
    },
}

/// Stand-in for the out-of-scope HTTP fetcher: answers `demo://bytes/N`
/// with an N-byte generated body and echoes anything else.
struct DemoFetcher {
    body_cap: usize,
}

#[async_trait]
impl Fetcher for DemoFetcher {
    async fn fetch(
        &self,
        url: &str,
        _method: RequestMethod,
        _headers: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        if url.is_empty() {
            return Err(FetchError::InvalidUrl("empty URL".to_string()));
        }
        let body = if let Some(rest) = url.strip_prefix("demo://bytes/") {
            let size: usize = rest
                .parse()
                .map_err(|_| FetchError::InvalidUrl(format!("bad byte count in {}", url)))?;
            if size > self.body_cap {
                return Err(FetchError::BodyTooLarge(self.body_cap));
            }
            (0..size).map(|i| (i % 251) as u8).collect()
        } else {
            format!("echo: {}", url).into_bytes()
        };
        Ok(FetchedResponse {
            status_code: 200,
            headers: vec![
                ("content-type".to_string(), "application/octet-stream".to_string()),
                ("server".to_string(), "akari-demo".to_string()),
            ],
            body,
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("AKARI-UDP starting");

    let (mut config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if let Some(psk) = args.psk {
        config.psk = Some(psk);
        config.psk_hex = None;
    }
    if let Some(hex_key) = args.psk_hex {
        config.psk_hex = Some(hex_key);
    }

    let psk = match config.psk_bytes() {
        Ok(psk) => psk,
        Err(e) => {
            error!("PSK error: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Serve => run_serve(&config, &psk).await,
        Command::Fetch { url, host, port } => run_fetch(&config, &psk, &url, &host, port).await,
        Command::Inspect { file, hex } => run_inspect(&psk, file.as_deref(), hex.as_deref()),
    }
}

async fn run_serve(config: &Config, psk: &[u8]) {
    let policy = config.policy.to_policy();
    let fetcher = Arc::new(DemoFetcher {
        body_cap: 8 * 1024 * 1024,
    });

    let mut server = match AkariServer::bind(
        &config.remote.host,
        config.remote.port,
        psk,
        fetcher,
        policy,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind responder: {}", e);
            std::process::exit(1);
        }
    };

    info!("Responder running, press Ctrl+C to exit");

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Serve loop error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("AKARI-UDP shutdown complete");
}

async fn run_fetch(config: &Config, psk: &[u8], url: &str, host: &str, port: Option<u16>) {
    let port = port.unwrap_or(config.remote.port);
    let mut client = match AkariClient::new(host, port, psk, config.client.flags()).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create client: {}", e);
            std::process::exit(1);
        }
    };

    let request_config = config.client.to_request_config();
    let started = std::time::Instant::now();
    match client
        .fetch(url, RequestMethod::Get, &[], &request_config)
        .await
    {
        Ok(response) => {
            let elapsed = started.elapsed();
            println!("status:   {}", response.status_code);
            for (name, value) in &response.headers {
                println!("header:   {}: {}", name, value);
            }
            println!("body:     {} bytes", response.body.len());
            println!("elapsed:  {:?}", round_ms(elapsed));
            println!(
                "stats:    sent={}B received={}B nacks={} retries={}",
                response.stats.bytes_sent,
                response.stats.bytes_received,
                response.stats.nacks_sent,
                response.stats.request_retries
            );
        }
        Err(e) => {
            error!("Fetch failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

fn run_inspect(psk: &[u8], file: Option<&std::path::Path>, hex_input: Option<&str>) {
    let datagram = match (file, hex_input) {
        (Some(path), _) => match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        (None, Some(text)) => match hex::decode(text.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Datagram is not valid hex: {}", e);
                std::process::exit(1);
            }
        },
        (None, None) => {
            error!("Provide a datagram file or --hex");
            std::process::exit(1);
        }
    };

    match akari_udp::wire::debug_dump(&datagram, &akari_udp::PskKey::new(psk)) {
        Ok(dump) => print!("{}", dump),
        Err(e) => {
            error!("Failed to decode datagram: {}", e);
            std::process::exit(1);
        }
    }
}
