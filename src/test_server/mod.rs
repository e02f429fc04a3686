//! A small SOCKS5 server with scripted behaviour, for exercising the
//! connector against real sockets without outside infrastructure.

pub mod session;

use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::auth::{AuthError, AuthManager, Credentials};
use crate::net::addr::Address;
use crate::net::conn::BufferedConnection;
use crate::proxy::negotiator::REPLY_GENERAL_FAILURE;
use crate::test_server::session::ClientSession;

const BUFFER_SIZE: usize = 4096;
const HASH_COST: u32 = 4;

/// How the server answers a CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Dial the requested (or overridden) destination and relay bytes.
    Connect,
    /// Start a success reply, then close before the CONNECT completes.
    SucceedAndClose,
    /// Reply with the given SOCKS5 error code.
    Fail(u8),
    /// Read everything, never answer.
    Ignore,
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "connect" => Ok(ServerMode::Connect),
            "succeed-and-close" | "succeed_and_close" => Ok(ServerMode::SucceedAndClose),
            "fail" => Ok(ServerMode::Fail(REPLY_GENERAL_FAILURE)),
            "ignore" => Ok(ServerMode::Ignore),
            other => Err(format!("unknown server mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestServerConfig {
    pub mode: ServerMode,
    /// Sleep before every reply.
    pub reply_delay: Option<Duration>,
    /// Credentials clients must present; `None` means no authentication.
    pub credentials: Option<Credentials>,
    /// Dial this instead of whatever the client asked for.
    pub destination_override: Option<Address>,
    pub connect_timeout: Duration,
}

impl Default for TestServerConfig {
    fn default() -> Self {
        TestServerConfig {
            mode: ServerMode::Connect,
            reply_delay: None,
            credentials: None,
            destination_override: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TestServerConfig {
    pub fn new(mode: ServerMode) -> Self {
        TestServerConfig {
            mode,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination_override = Some(destination);
        self
    }
}

#[derive(Error, Debug)]
pub enum TestServerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Credential setup failed: {0}")]
    AuthError(#[from] AuthError),
}

/// A running test server. Dropping it stops the accept loop; sessions
/// already in progress finish on their own.
pub struct Socks5TestServer {
    local_addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Socks5TestServer {
    /// Starts a server on an ephemeral loopback port.
    pub async fn start(config: TestServerConfig) -> Result<Self, TestServerError> {
        Self::bind("127.0.0.1:0", config).await
    }

    pub async fn bind(addr: &str, config: TestServerConfig) -> Result<Self, TestServerError> {
        let auth = match &config.credentials {
            Some(creds) => Some(Arc::new(AuthManager::from_credentials(creds, HASH_COST)?)),
            None => None,
        };
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let sessions = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(
            "SOCKS5 test server on {} in {:?} mode",
            local_addr, config.mode
        );

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            auth,
            Arc::clone(&sessions),
            shutdown_rx,
        ));

        Ok(Socks5TestServer {
            local_addr,
            sessions,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> Address {
        Address::Ip(self.local_addr)
    }

    /// Connections accepted so far.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Stops accepting and waits for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Socks5TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<TestServerConfig>,
    auth: Option<Arc<AuthManager>>,
    sessions: Arc<AtomicUsize>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        sessions.fetch_add(1, Ordering::SeqCst);
                        let config = Arc::clone(&config);
                        let auth = auth.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, config, auth).await {
                                debug!("Session from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Test server shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: Arc<TestServerConfig>,
    auth: Option<Arc<AuthManager>>,
) -> Result<(), session::SessionError> {
    stream.set_nodelay(true)?;
    let conn = BufferedConnection::new(stream, BUFFER_SIZE);
    debug!("Session from {}", conn.peer_addr()?);
    ClientSession::new(conn, config, auth).run().await
}

/// The simulated far end: writes back whatever it reads.
pub struct EchoServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Ok(EchoServer { local_addr, task })
    }

    pub fn address(&self) -> Address {
        Address::Ip(self.local_addr)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
