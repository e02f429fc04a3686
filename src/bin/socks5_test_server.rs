use clap::Parser;
use socks_chain::common::auth::Credentials;
use socks_chain::common::logger;
use socks_chain::net::addr::Address;
use socks_chain::test_server::{ServerMode, Socks5TestServer, TestServerConfig};
use std::time::Duration;

/// Runs the scripted SOCKS5 server on its own, for manual chain testing.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "ADDRESS", default_value = "127.0.0.1:1080")]
    listen: String,

    /// connect, succeed-and-close, fail or ignore
    #[arg(short, long, default_value = "connect")]
    mode: ServerMode,

    /// Reply code sent in fail mode
    #[arg(long, value_name = "CODE", default_value_t = 0x01)]
    fail_code: u8,

    #[arg(long, value_name = "MILLISECONDS")]
    delay: Option<u64>,

    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Dial this instead of the requested destination
    #[arg(long, value_name = "HOST:PORT")]
    destination: Option<Address>,

    #[arg(short = 'v', long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = logger::setup_console_logger(&args.log_level) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let mode = match args.mode {
        ServerMode::Fail(_) => ServerMode::Fail(args.fail_code),
        other => other,
    };
    let mut config = TestServerConfig::new(mode);
    if let Some(delay) = args.delay {
        config = config.with_reply_delay(Duration::from_millis(delay));
    }
    if let (Some(username), Some(password)) = (args.username, args.password) {
        config = config.with_credentials(Credentials::new(username, password));
    }
    if let Some(destination) = args.destination {
        config = config.with_destination(destination);
    }

    let server = match Socks5TestServer::bind(&args.listen, config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to start test server on {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };

    println!("SOCKS5 test server listening on {}", server.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for Ctrl-C: {}", e);
    }
    server.shutdown().await;
}
