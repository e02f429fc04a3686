//! The per-destination connection attempt.
//!
//! An attempt walks the proxy network depth-first: it opens a TCP connection
//! to the current level-0 candidate, then chains one SOCKS5 negotiation per
//! level over that socket until the last proxy has connected to the
//! destination. Each suspension point is a [`Step`] the driver task resumes
//! from, so the continuation of every hop is explicit.
//!
//! Termination goes through a single compare-and-swap on `terminating`:
//! whichever of success, failure, total timeout or `cancel()` wins the swap
//! delivers the callback, and every later trigger is a no-op.

use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::net::addr::Address;
use crate::net::socket::SocketFactory;
use crate::proxy::connector::Connector;
use crate::proxy::error::{AttemptStatus, ChainError, DetailedStatus, HopError};
use crate::proxy::negotiator::{self, NegotiationError};
use crate::proxy::path::ProxyPath;

pub type AttemptCallback = Box<dyn FnOnce(AttemptOutcome) + Send + 'static>;

/// Shared handle to an attempt. Reactor tasks hold their own clone, so an
/// attempt stays alive until its driver finishes even if the caller drops it.
pub type AttemptHandle = Arc<ConnectionAttempt>;

/// What the callback receives when the attempt concludes.
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    /// The chained connection to the destination, only set on success.
    pub stream: Option<TcpStream>,
    pub factory: Arc<SocketFactory>,
    pub detail: DetailedStatus,
}

impl AttemptOutcome {
    pub fn into_result(self) -> Result<TcpStream, ChainError> {
        match (self.status, self.stream) {
            (AttemptStatus::Success, Some(stream)) => Ok(stream),
            (AttemptStatus::Timeout, _) => Err(ChainError::TimedOut(self.detail)),
            (AttemptStatus::Cancel, _) => Err(ChainError::Canceled),
            (_, _) => Err(ChainError::Failed(self.detail)),
        }
    }
}

impl fmt::Debug for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptOutcome")
            .field("status", &self.status)
            .field("stream", &self.stream.as_ref().map(|s| s.peer_addr().ok()))
            .field("detail", &self.detail)
            .finish()
    }
}

/// Suspension points of a traversal.
enum Step {
    TcpConnect,
    SocksConnect(TcpStream),
    Done(TcpStream),
}

/// Result of trying to win the termination guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Delivered,
    Retry,
    AlreadyTerminated,
}

/// Mutable traversal state. Owned by the driver task alone, so the socket
/// being negotiated is never shared with client threads; cancelling aborts
/// the driver, which drops the socket and any in-flight negotiation with it.
struct AttemptState {
    path: ProxyPath,
    retries_left: u32,
}

pub struct ConnectionAttempt {
    connector: Arc<Connector>,
    destination: Address,
    proxy_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    callback: Mutex<Option<AttemptCallback>>,
    terminating: AtomicBool,
    cancel_requested: AtomicBool,
    started: AtomicBool,
    driver: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for ConnectionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("destination", &self.destination)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("total_timeout", &self.total_timeout)
            .field("terminating", &self.terminating.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionAttempt {
    pub(crate) fn new(
        connector: Arc<Connector>,
        callback: AttemptCallback,
        proxy_timeout: Option<Duration>,
        total_timeout: Option<Duration>,
        destination: Address,
    ) -> Self {
        ConnectionAttempt {
            connector,
            destination,
            proxy_timeout: proxy_timeout.filter(|t| !t.is_zero()),
            total_timeout: total_timeout.filter(|t| !t.is_zero()),
            callback: Mutex::new(Some(callback)),
            terminating: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Whether the callback has fired or is about to.
    pub fn is_terminated(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Begins the attempt on the connector's runtime. The outcome is
    /// delivered only through the callback.
    pub fn start(self: &Arc<Self>) {
        self.spawn_driver(false);
    }

    /// Like [`start`](Self::start), but failing to bind a source port inside
    /// the connector's range fails the candidate instead of falling back to
    /// an OS-assigned port.
    pub fn start_strict(self: &Arc<Self>) {
        self.spawn_driver(true);
    }

    /// Ends the attempt with [`AttemptStatus::Cancel`]. Safe from any thread
    /// and at any time; after termination it has no effect.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.terminate(
            AttemptStatus::Cancel,
            None,
            DetailedStatus::new("canceled by caller"),
            None,
        );
    }

    fn spawn_driver(self: &Arc<Self>, strict: bool) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Connection attempt to {} already started", self.destination);
            return;
        }

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_terminated() {
            debug!(
                "Connection attempt to {} terminated before start",
                self.destination
            );
            return;
        }
        let attempt = Arc::clone(self);
        let task = self.connector.runtime().spawn(attempt.run(strict));
        *driver = Some(task.abort_handle());
    }

    async fn run(self: Arc<Self>, strict: bool) {
        let network = self.connector.network();
        let mut state = AttemptState {
            path: ProxyPath::new(network),
            retries_left: self.connector.retries(),
        };

        debug!(
            "Connecting to {} through {} proxy level(s)",
            self.destination,
            network.num_levels()
        );

        match self.total_timeout {
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let drive = self.drive(&mut state, strict);
                if tokio::time::timeout_at(deadline, drive).await.is_err() {
                    self.terminate(
                        AttemptStatus::Timeout,
                        None,
                        DetailedStatus::new(format!(
                            "no connection to {} within {:?}",
                            self.destination, limit
                        )),
                        None,
                    );
                }
            }
            None => self.drive(&mut state, strict).await,
        }
    }

    /// Runs traversals until one terminates the attempt.
    async fn drive(&self, state: &mut AttemptState, strict: bool) {
        loop {
            let termination = match self.traverse(state, strict).await {
                Ok(stream) => self.terminate(
                    AttemptStatus::Success,
                    Some(stream),
                    DetailedStatus::new(format!("connected to {}", self.destination)),
                    Some(state),
                ),
                Err(detail) => self.terminate(AttemptStatus::Error, None, detail, Some(state)),
            };
            if termination != Termination::Retry {
                return;
            }
        }
    }

    /// One depth-first pass over the proxy network.
    async fn traverse(
        &self,
        state: &mut AttemptState,
        strict: bool,
    ) -> Result<TcpStream, DetailedStatus> {
        let mut step = Step::TcpConnect;
        loop {
            step = match step {
                Step::TcpConnect => self.tcp_connect(state, strict).await?,
                Step::SocksConnect(stream) => self.socks_connect(state, stream).await?,
                Step::Done(stream) => return Ok(stream),
            };
        }
    }

    /// Opens the first hop, trying level-0 candidates from the current index.
    async fn tcp_connect(
        &self,
        state: &mut AttemptState,
        strict: bool,
    ) -> Result<Step, DetailedStatus> {
        let network = self.connector.network();
        state.path.restart();
        loop {
            let proxy = state
                .path
                .current(network)
                .ok_or_else(|| DetailedStatus::new("proxy path out of range"))?;

            debug!(
                "TCP connect to level 0 proxy {} ({:?})",
                proxy.address,
                state.path.indices()
            );
            let connect = self.connector.factory().connect(&proxy.address, strict);
            let result = match self.proxy_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .unwrap_or(Err(HopError::ConnectTimeout(limit))),
                None => connect.await,
            };

            if let Some(next) = self.tcp_connect_cb(state, &proxy.address, result)? {
                return Ok(next);
            }
        }
    }

    /// Resumes after the first-hop connect finished or timed out. Returns
    /// `None` to try the next level-0 candidate.
    fn tcp_connect_cb(
        &self,
        state: &mut AttemptState,
        proxy: &Address,
        result: Result<TcpStream, HopError>,
    ) -> Result<Option<Step>, DetailedStatus> {
        match result {
            Ok(stream) => {
                state.path.restart();
                Ok(Some(Step::SocksConnect(stream)))
            }
            Err(e) => {
                warn!("Proxy {} unreachable: {}", proxy, e);
                let detail = DetailedStatus::at(proxy, &e);
                match state.path.advance(0) {
                    Some(_) => Ok(None),
                    None => Err(detail),
                }
            }
        }
    }

    /// Negotiates the current level's hop over `stream`.
    async fn socks_connect(
        &self,
        state: &mut AttemptState,
        mut stream: TcpStream,
    ) -> Result<Step, DetailedStatus> {
        let network = self.connector.network();
        let proxy = state
            .path
            .current(network)
            .ok_or_else(|| DetailedStatus::new("proxy path out of range"))?;
        let target = state
            .path
            .next_hop(network)
            .map_or(&self.destination, |next| &next.address);

        debug!(
            "Negotiating with level {} proxy {} for {}",
            state.path.level(),
            proxy.address,
            target
        );
        let result = negotiator::negotiate(
            &mut stream,
            target,
            proxy.credentials.as_ref(),
            self.proxy_timeout,
        )
        .await;

        self.socks_connect_cb(state, &proxy.address, stream, result)
    }

    /// Resumes after a negotiation. Success moves one level deeper, reusing
    /// the same socket; failure blames the current level's proxy, closes the
    /// socket and backtracks.
    fn socks_connect_cb(
        &self,
        state: &mut AttemptState,
        proxy: &Address,
        stream: TcpStream,
        result: Result<Address, NegotiationError>,
    ) -> Result<Step, DetailedStatus> {
        match result {
            Ok(bound) => {
                debug!("Proxy {} connected (bound {})", proxy, bound);
                if state.path.descend() {
                    Ok(Step::SocksConnect(stream))
                } else {
                    Ok(Step::Done(stream))
                }
            }
            Err(e) => {
                drop(stream);
                let level = state.path.level();
                warn!("Negotiation with level {} proxy {} failed: {}", level, proxy, e);
                let detail = DetailedStatus::at(proxy, &HopError::from(e));
                match state.path.advance(level) {
                    Some(changed) => {
                        debug!(
                            "Backtracked to level {} ({:?})",
                            changed,
                            state.path.indices()
                        );
                        Ok(Step::TcpConnect)
                    }
                    None => Err(detail),
                }
            }
        }
    }

    /// The single exit of the state machine.
    ///
    /// `state` is only available to the driver; without it (cancel, total
    /// timeout) no retry is possible.
    fn terminate(
        &self,
        status: AttemptStatus,
        stream: Option<TcpStream>,
        detail: DetailedStatus,
        state: Option<&mut AttemptState>,
    ) -> Termination {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                "Ignoring {} for {}: attempt already terminated",
                status, self.destination
            );
            return Termination::AlreadyTerminated;
        }

        if status == AttemptStatus::Error {
            if let Some(state) = state {
                if state.retries_left > 0 && !self.cancel_requested.load(Ordering::SeqCst) {
                    state.retries_left -= 1;
                    state.path.reset();
                    info!(
                        "Retrying connection to {} after failure ({}), {} retries left",
                        self.destination, detail, state.retries_left
                    );
                    self.terminating.store(false, Ordering::SeqCst);
                    // A cancel that lost the swap while the guard was held
                    // must not be dropped.
                    if self.cancel_requested.load(Ordering::SeqCst) {
                        self.cancel();
                        return Termination::AlreadyTerminated;
                    }
                    return Termination::Retry;
                }
            }
        }

        // Every other status is reached from inside the driver itself.
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (AttemptStatus::Cancel, Some(driver)) = (status, driver) {
            driver.abort();
        }

        match status {
            AttemptStatus::Success => info!("Connected to {}", self.destination),
            _ => info!(
                "Connection to {} ended with {}: {}",
                self.destination, status, detail
            ),
        }

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(AttemptOutcome {
                status,
                stream,
                factory: Arc::clone(self.connector.factory()),
                detail,
            });
        }
        Termination::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::auth::Credentials;
    use crate::proxy::connector::ConnectOptions;
    use crate::proxy::network::{ProxyDescription, ProxyNetworkDescription};
    use crate::test_server::{EchoServer, ServerMode, Socks5TestServer, TestServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    async fn server(mode: ServerMode) -> Socks5TestServer {
        Socks5TestServer::start(TestServerConfig::new(mode))
            .await
            .unwrap()
    }

    fn proxy(server: &Socks5TestServer) -> ProxyDescription {
        ProxyDescription::new(server.address())
    }

    async fn closed_port() -> Address {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Address::Ip(addr)
    }

    fn build_connector(levels: Vec<Vec<ProxyDescription>>, retries: u32) -> Arc<Connector> {
        Connector::builder(ProxyNetworkDescription::from_levels(levels))
            .retries(retries)
            .build()
            .unwrap()
    }

    fn attempt(
        connector: &Arc<Connector>,
        destination: Address,
        proxy_timeout: Option<Duration>,
        total_timeout: Option<Duration>,
    ) -> (AttemptHandle, UnboundedReceiver<AttemptOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = connector.make_connection_attempt_handle(
            move |outcome| {
                let _ = tx.send(outcome);
            },
            proxy_timeout,
            total_timeout,
            destination,
        );
        (handle, rx)
    }

    /// Waits a little and checks the callback did not fire again.
    async fn assert_no_more_outcomes(rx: &mut UnboundedReceiver<AttemptOutcome>) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    async fn assert_echoes(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn test_single_level_success() {
        let echo = EchoServer::start().await.unwrap();
        let p = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 0);

        let (handle, mut rx) = attempt(&connector, echo.address(), None, None);
        handle.start();
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);
        assert!(handle.is_terminated());
        let mut stream = outcome.stream.unwrap();
        assert_echoes(&mut stream, b"one hop").await;
        assert_eq!(p.session_count(), 1);
        assert_no_more_outcomes(&mut rx).await;
    }

    #[tokio::test]
    async fn test_two_level_chain() {
        let echo = EchoServer::start().await.unwrap();
        let p0 = server(ServerMode::Connect).await;
        let p1 = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&p0)], vec![proxy(&p1)]], 0);

        let (handle, mut rx) = attempt(&connector, echo.address(), None, None);
        connector.start_connection_attempt(&handle);

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);
        let mut stream = outcome.stream.unwrap();
        assert_echoes(&mut stream, b"two hops").await;
        assert_eq!(p0.session_count(), 1);
        assert_eq!(p1.session_count(), 1);
    }

    #[tokio::test]
    async fn test_error_names_last_failed_proxy() {
        let a = server(ServerMode::Fail(0x05)).await;
        let b = server(ServerMode::Fail(0x05)).await;
        let connector = build_connector(vec![vec![proxy(&a), proxy(&b)]], 0);

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert!(outcome.stream.is_none());
        assert_eq!(outcome.detail.address, Some(b.address()));
        assert_eq!(a.session_count(), 1);
        assert_eq!(b.session_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_first_level_blames_last_candidate() {
        let a = server(ServerMode::Fail(0x01)).await;
        let b = server(ServerMode::Fail(0x01)).await;
        let c = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&a), proxy(&b)], vec![proxy(&c)]], 0);

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert_eq!(outcome.detail.address, Some(b.address()));
        assert_eq!(a.session_count(), 1);
        assert_eq!(b.session_count(), 1);
        assert_eq!(c.session_count(), 0);
    }

    #[tokio::test]
    async fn test_retries_consume_budget_then_report_once() {
        let config = TestServerConfig::new(ServerMode::Connect)
            .with_credentials(Credentials::new("user", "right"));
        let p = Socks5TestServer::start(config).await.unwrap();
        let wrong = ProxyDescription::with_credentials(
            p.address(),
            Credentials::new("user", "wrong"),
        );
        let connector = build_connector(vec![vec![wrong]], 2);

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert_eq!(p.session_count(), 3);
        assert_no_more_outcomes(&mut rx).await;
    }

    #[tokio::test]
    async fn test_cancel_after_success_is_noop() {
        let echo = EchoServer::start().await.unwrap();
        let p = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 0);

        let (handle, mut rx) = attempt(&connector, echo.address(), None, None);
        handle.start();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);

        connector.cancel_connection_attempt(&handle);
        assert_no_more_outcomes(&mut rx).await;
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let p = server(ServerMode::Ignore).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 3);

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Cancel);
        assert!(outcome.stream.is_none());
        assert_eq!(p.session_count(), 1);
        assert_no_more_outcomes(&mut rx).await;
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let p = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 0);

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.cancel();
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Cancel);
        assert_no_more_outcomes(&mut rx).await;
        assert_eq!(p.session_count(), 0);
    }

    #[tokio::test]
    async fn test_total_timeout_is_not_retried() {
        let p = server(ServerMode::Ignore).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 3);

        let (handle, mut rx) = attempt(
            &connector,
            "192.0.2.1:80".parse().unwrap(),
            None,
            Some(Duration::from_millis(200)),
        );
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Timeout);
        assert!(matches!(
            outcome.into_result(),
            Err(ChainError::TimedOut(_))
        ));
        assert_eq!(p.session_count(), 1);
        assert_no_more_outcomes(&mut rx).await;
    }

    #[tokio::test]
    async fn test_proxy_timeout_moves_to_next_candidate() {
        let echo = EchoServer::start().await.unwrap();
        let silent = server(ServerMode::Ignore).await;
        let good = server(ServerMode::Connect).await;
        let connector = build_connector(vec![vec![proxy(&silent), proxy(&good)]], 0);

        let (handle, mut rx) = attempt(
            &connector,
            echo.address(),
            Some(Duration::from_millis(100)),
            None,
        );
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);
        assert_eq!(silent.session_count(), 1);
        assert_eq!(good.session_count(), 1);
    }

    #[tokio::test]
    async fn test_deep_failure_backtracks_and_reconnects() {
        let echo = EchoServer::start().await.unwrap();
        let a = server(ServerMode::Connect).await;
        let b = server(ServerMode::Connect).await;
        let c = server(ServerMode::Fail(0x02)).await;
        let d = server(ServerMode::Connect).await;
        let connector = build_connector(
            vec![vec![proxy(&a), proxy(&b)], vec![proxy(&c), proxy(&d)]],
            0,
        );

        let (handle, mut rx) = attempt(&connector, echo.address(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);
        let mut stream = outcome.stream.unwrap();
        assert_echoes(&mut stream, b"a then d").await;
        assert_eq!(a.session_count(), 2);
        assert_eq!(b.session_count(), 0);
        assert_eq!(c.session_count(), 1);
        assert_eq!(d.session_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_first_candidate() {
        let echo = EchoServer::start().await.unwrap();
        let p = server(ServerMode::Connect).await;
        let closed = ProxyDescription::new(closed_port().await);
        let connector = build_connector(vec![vec![closed, proxy(&p)]], 0);

        let (handle, mut rx) = attempt(&connector, echo.address(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Success);
        assert_eq!(p.session_count(), 1);
    }

    #[tokio::test]
    async fn test_all_first_hops_unreachable() {
        let first = closed_port().await;
        let last = closed_port().await;
        let connector = build_connector(
            vec![vec![
                ProxyDescription::new(first),
                ProxyDescription::new(last.clone()),
            ]],
            0,
        );

        let (handle, mut rx) = attempt(&connector, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert_eq!(outcome.detail.address, Some(last));
    }

    #[tokio::test]
    async fn test_succeed_and_close_is_an_error() {
        let p = server(ServerMode::SucceedAndClose).await;
        let single = build_connector(vec![vec![proxy(&p)]], 0);
        let (handle, mut rx) = attempt(&single, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert!(outcome.stream.is_none());
        assert_eq!(outcome.detail.address, Some(p.address()));

        let err = single
            .connect("192.0.2.1:80".parse().unwrap(), ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Failed(_)));

        let next = server(ServerMode::Connect).await;
        let chained = build_connector(vec![vec![proxy(&p)], vec![proxy(&next)]], 0);
        let (handle, mut rx) = attempt(&chained, "192.0.2.1:80".parse().unwrap(), None, None);
        handle.start();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Error);
        assert_eq!(outcome.detail.address, Some(p.address()));
        assert_eq!(next.session_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_reports_failure() {
        let p = server(ServerMode::Fail(0x04)).await;
        let connector = build_connector(vec![vec![proxy(&p)]], 0);

        let err = connector
            .connect("192.0.2.1:80".parse().unwrap(), ConnectOptions::default())
            .await
            .unwrap_err();
        match err {
            ChainError::Failed(detail) => assert_eq!(detail.address, Some(p.address())),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
