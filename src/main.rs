use clap::Parser;
use log::LevelFilter;
use socks_chain::common::config::Config;
use socks_chain::common::logger;
use socks_chain::proxy::{Connector, TcpForwarder};
use tokio::net::TcpListener;

/// Fallback logger that writes to stderr when log4rs fails to initialise.
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LevelFilter::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Forward local TCP connections through a SOCKS5 proxy chain", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,

    #[arg(long, value_name = "ADDRESS")]
    listen_address: Option<String>,

    #[arg(short, long, value_name = "HOST:PORT")]
    destination: Option<String>,

    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_name = "COUNT")]
    retries: Option<u32>,

    #[arg(long, value_name = "MILLISECONDS")]
    proxy_timeout: Option<u64>,

    #[arg(long, value_name = "MILLISECONDS")]
    total_timeout: Option<u64>,

    #[arg(long, value_name = "COUNT")]
    max_connections: Option<usize>,

    #[arg(long)]
    strict_source_port: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Some(listen_address) = args.listen_address {
        config.listen_address = listen_address;
    }
    if let Some(destination) = args.destination {
        config.destination = destination;
    }
    if args.log_level.to_lowercase() != config.log.level.to_lowercase() {
        config.log.level = args.log_level;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if let Some(proxy_timeout) = args.proxy_timeout {
        config.proxy_timeout_ms = proxy_timeout;
    }
    if let Some(total_timeout) = args.total_timeout {
        config.total_timeout_ms = total_timeout;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }
    if args.strict_source_port {
        config.strict_source_port = true;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = logger::setup_logger(config.log.clone()) {
        eprintln!("Failed to initialize logger: {}", e);
        if log::set_boxed_logger(Box::new(SimpleLogger)).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    }

    log::info!("Starting with config: {:?}", config.redacted());

    // Both were checked by validate()
    let (network, destination) = match (config.network(), config.destination()) {
        (Ok(network), Ok(destination)) => (network, destination),
        (Err(e), _) | (_, Err(e)) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut builder = Connector::builder(network).retries(config.retries);
    if let Some((min, max)) = config.source_ports() {
        builder = builder.source_ports(min, max);
    }
    let connector = match builder.build() {
        Ok(connector) => connector,
        Err(e) => {
            log::error!("Failed to create connector: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", config.listen_address, e);
            std::process::exit(1);
        }
    };

    println!(
        "Forwarding {} to {} through {} proxy level(s)",
        config.listen_address,
        destination,
        connector.network().num_levels()
    );

    let forwarder = TcpForwarder::new(
        connector,
        destination,
        config.connect_options(),
        config.max_connections,
    );

    forwarder.run(listener).await;
}
