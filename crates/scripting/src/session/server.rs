//! Rendezvous listener.
//!
//! The listener runs only while at least one client is registered. It binds
//! lazily on the first registration and shuts down when the last one is
//! released, so sequential interactive calls each get a fresh start/stop
//! cycle while overlapping ones share a single listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rendezvous::{
    decode_handshake, SecurityKey, StateMachine, HANDSHAKE_TERMINATOR, MAX_HANDSHAKE_SIZE,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connection, SessionClient, SessionError, TerminalLauncher};
use crate::config::RendezvousConfig;

/// How long a connected peer may take to send its handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`SessionServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Nothing is bound and no client is registered.
    Closed,
    /// The listener is being bound.
    Starting,
    /// Accepting terminal connections.
    Started,
    /// The accept loop is being shut down.
    Closing,
}

enum Registration {
    /// Waiting for a terminal to present the key.
    Pending(oneshot::Sender<Connection>),
    /// A terminal has been matched; the key is spent.
    Active,
}

type Registrations = Arc<DashMap<SecurityKey, Registration>>;

struct Listener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Lifecycle {
    state: StateMachine<ServerState>,
    listener: Option<Listener>,
}

/// Matches incoming terminal connections to registered clients.
pub struct SessionServer<L> {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    launcher: L,
    lifecycle: Arc<Mutex<Lifecycle>>,
    registrations: Registrations,
}

impl<L: TerminalLauncher> SessionServer<L> {
    /// Creates a closed server. Nothing is bound until the first
    /// registration.
    pub fn new(config: &RendezvousConfig, launcher: L) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout(),
            launcher,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: StateMachine::new(ServerState::Closed, "SessionServer"),
                listener: None,
            })),
            registrations: Arc::new(DashMap::new()),
        }
    }

    pub async fn state(&self) -> ServerState {
        self.lifecycle.lock().await.state.current()
    }

    /// Returns the bound address while the listener is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.listener.as_ref().map(|l| l.addr)
    }

    /// Number of registrations that have not been released.
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Registers `client`, opens its terminal and waits for the terminal to
    /// connect.
    ///
    /// Returns the client in the connected state. On failure, or when the
    /// returned future is dropped before it completes, the registration is
    /// released again.
    pub async fn register(&self, mut client: SessionClient) -> Result<SessionClient, SessionError> {
        let key = client.security_key().clone();
        let (tx, rx) = oneshot::channel();

        let (addr, pending) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let addr = self.start(&mut lifecycle)?;
            self.registrations
                .insert(key.clone(), Registration::Pending(tx));
            (addr, self.unfinished(key.clone()))
        };

        debug!(
            key = %key.fingerprint(),
            title = %client.title(),
            %addr,
            "Registered client, launching terminal"
        );

        if let Err(e) = self.launcher.launch(client.title(), &key, addr).await {
            pending.disarm();
            self.release(&key).await?;
            return Err(e);
        }

        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(key = %key.fingerprint(), ?timeout, "Terminal did not connect in time");
                    pending.disarm();
                    self.release(&key).await?;
                    return Err(SessionError::Timeout(timeout));
                }
            },
            None => rx.await,
        };

        // The sender is only dropped by a release, which already removed
        // the entry
        pending.disarm();
        let connection = received.map_err(|_| SessionError::Cancelled)?;
        if let Err(e) = client.attach(connection) {
            self.release(&key).await?;
            return Err(e);
        }

        info!(key = %key.fingerprint(), title = %client.title(), "Terminal connected");
        Ok(client)
    }

    /// Releases `client`'s registration and closes its connection.
    ///
    /// The listener stops once no registrations remain.
    pub async fn un_register(&self, client: &mut SessionClient) -> Result<(), SessionError> {
        if client.is_connected() {
            client.detach().await?;
        }
        self.release(client.security_key()).await
    }

    /// Abandons a registration that is still waiting for its terminal.
    ///
    /// The pending [`SessionServer::register`] call returns
    /// [`SessionError::Cancelled`].
    pub async fn cancel(&self, key: &SecurityKey) -> Result<(), SessionError> {
        self.release(key).await
    }

    fn unfinished(&self, key: SecurityKey) -> Unfinished {
        Unfinished {
            key: Some(key),
            lifecycle: Arc::clone(&self.lifecycle),
            registrations: Arc::clone(&self.registrations),
        }
    }

    /// Binds and spawns the accept loop unless already started.
    ///
    /// Contains no await point, so a dropped caller never leaves the server
    /// half started.
    fn start(&self, lifecycle: &mut Lifecycle) -> Result<SocketAddr, SessionError> {
        if lifecycle.state.change(ServerState::Closed, ServerState::Starting) {
            let bind_addr = format!("{}:{}", self.host, self.port);
            let listener = match bind(&bind_addr) {
                Ok(listener) => listener,
                Err(e) => {
                    lifecycle
                        .state
                        .require(ServerState::Starting, ServerState::Closed)?;
                    return Err(e);
                }
            };

            let BoundListener {
                inner,
                addr,
                shutdown,
            } = listener;
            let task = tokio::spawn(accept_loop(
                inner,
                Arc::clone(&self.registrations),
                shutdown.clone(),
            ));
            lifecycle.listener = Some(Listener {
                addr,
                shutdown,
                task,
            });
            lifecycle
                .state
                .require(ServerState::Starting, ServerState::Started)?;
            info!(%addr, "Rendezvous listener started");
        }

        lifecycle
            .listener
            .as_ref()
            .map(|l| l.addr)
            .ok_or(SessionError::NotListening)
    }

    async fn release(&self, key: &SecurityKey) -> Result<(), SessionError> {
        release(&self.lifecycle, &self.registrations, key).await
    }
}

impl<L> Drop for SessionServer<L> {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.lifecycle.try_lock() {
            if let Some(listener) = lifecycle.listener.take() {
                listener.shutdown.cancel();
            }
        }
    }
}

/// Releases a registration whose [`SessionServer::register`] call was
/// dropped before it finished.
struct Unfinished {
    key: Option<SecurityKey>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    registrations: Registrations,
}

impl Unfinished {
    /// The registration is now released or owned by the caller.
    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        if self.registrations.remove(&key).is_some() {
            debug!(key = %key.fingerprint(), "Dropped unfinished registration");
        }

        match self.lifecycle.try_lock() {
            Ok(mut lifecycle) => {
                if self.registrations.is_empty() {
                    if let Err(e) = shutdown(&mut lifecycle) {
                        warn!(error = %e, "Failed to stop listener after dropped registration");
                    }
                }
            }
            // Whoever holds the lock may have checked for emptiness before
            // our removal
            Err(_) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let lifecycle = Arc::clone(&self.lifecycle);
                let registrations = Arc::clone(&self.registrations);
                handle.spawn(async move {
                    if let Err(e) = release(&lifecycle, &registrations, &key).await {
                        warn!(error = %e, "Failed to stop listener after dropped registration");
                    }
                });
            }
        }
    }
}

async fn release(
    lifecycle: &Mutex<Lifecycle>,
    registrations: &Registrations,
    key: &SecurityKey,
) -> Result<(), SessionError> {
    let mut lifecycle = lifecycle.lock().await;

    if let Some((_, registration)) = registrations.remove(key) {
        if matches!(registration, Registration::Pending(_)) {
            debug!(key = %key.fingerprint(), "Released pending registration");
        }
    }

    if registrations.is_empty() {
        if let Some(task) = shutdown(&mut lifecycle)? {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
    }
    Ok(())
}

/// Moves a started server to CLOSED and signals the accept loop, returning
/// its task. Does nothing unless STARTED.
fn shutdown(lifecycle: &mut Lifecycle) -> Result<Option<JoinHandle<()>>, SessionError> {
    if !lifecycle.state.change(ServerState::Started, ServerState::Closing) {
        return Ok(None);
    }

    let task = lifecycle.listener.take().map(|listener| {
        listener.shutdown.cancel();
        listener.task
    });

    lifecycle
        .state
        .require(ServerState::Closing, ServerState::Closed)?;
    info!("Rendezvous listener stopped");
    Ok(task)
}

struct BoundListener {
    inner: TcpListener,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

fn bind(bind_addr: &str) -> Result<BoundListener, SessionError> {
    let bind_error = |source| SessionError::Bind {
        addr: bind_addr.to_string(),
        source,
    };
    let std_listener = std::net::TcpListener::bind(bind_addr).map_err(bind_error)?;
    std_listener.set_nonblocking(true).map_err(bind_error)?;
    let inner = TcpListener::from_std(std_listener).map_err(bind_error)?;
    let addr = inner.local_addr()?;
    Ok(BoundListener {
        inner,
        addr,
        shutdown: CancellationToken::new(),
    })
}

async fn accept_loop(listener: TcpListener, registrations: Registrations, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registrations = Arc::clone(&registrations);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, registrations).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept rendezvous connection");
                }
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, registrations: Registrations) {
    let mut connection = BufReader::new(stream);

    let key = match read_handshake(&mut connection).await {
        Ok(key) => key,
        Err(e) => {
            warn!(%peer, error = %e, "Rejecting connection with invalid handshake");
            reject(connection).await;
            return;
        }
    };

    let pending = match registrations.get_mut(&key) {
        Some(mut entry) => match std::mem::replace(entry.value_mut(), Registration::Active) {
            Registration::Pending(tx) => Some(tx),
            Registration::Active => None,
        },
        None => None,
    };

    match pending {
        Some(tx) => {
            if tx.send(connection).is_err() {
                debug!(%peer, key = %key.fingerprint(), "Registration gave up before its terminal arrived");
            } else {
                debug!(%peer, key = %key.fingerprint(), "Matched terminal to registration");
            }
        }
        None => {
            warn!(%peer, key = %key.fingerprint(), "Closing connection for unknown or spent key");
            reject(connection).await;
        }
    }
}

async fn read_handshake(connection: &mut Connection) -> Result<SecurityKey, SessionError> {
    let mut line = Vec::new();
    let mut limited = (&mut *connection).take(MAX_HANDSHAKE_SIZE as u64 + 1);

    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        limited.read_until(HANDSHAKE_TERMINATOR, &mut line),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;

    Ok(decode_handshake(&line)?)
}

async fn reject(connection: Connection) {
    let mut stream = connection.into_inner();
    stream.shutdown().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InlineLauncher;
    use bytes::Bytes;
    use rendezvous::encode_handshake;
    use tokio::sync::mpsc;

    fn config() -> RendezvousConfig {
        RendezvousConfig {
            port: 0,
            ..RendezvousConfig::default()
        }
    }

    fn inline_server() -> (SessionServer<InlineLauncher>, mpsc::UnboundedReceiver<Bytes>) {
        let (launcher, rx) = InlineLauncher::new();
        (SessionServer::new(&config(), launcher), rx)
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.extend_from_slice(&chunk);
        }
        received
    }

    /// Launches nothing; tests dial the listener themselves.
    struct ManualLauncher {
        addr: mpsc::UnboundedSender<SocketAddr>,
    }

    impl TerminalLauncher for ManualLauncher {
        async fn launch(
            &self,
            _title: &str,
            _key: &SecurityKey,
            addr: SocketAddr,
        ) -> Result<(), SessionError> {
            self.addr.send(addr).ok();
            Ok(())
        }
    }

    struct FailingLauncher;

    impl TerminalLauncher for FailingLauncher {
        async fn launch(
            &self,
            _title: &str,
            _key: &SecurityKey,
            _addr: SocketAddr,
        ) -> Result<(), SessionError> {
            Err(SessionError::Launch("no display".to_string()))
        }
    }

    #[tokio::test]
    async fn test_new_server_is_closed() {
        let (server, _rx) = inline_server();
        assert_eq!(server.state().await, ServerState::Closed);
        assert_eq!(server.local_addr().await, None);
        assert_eq!(server.registered(), 0);
    }

    #[tokio::test]
    async fn test_register_forward_unregister() {
        let (server, mut rx) = inline_server();

        let mut client = server.register(SessionClient::new("t")).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(server.state().await, ServerState::Started);
        assert_eq!(server.registered(), 1);

        client.write_all(b"line one\n").await.unwrap();
        client.write_all(b"line two\n").await.unwrap();
        server.un_register(&mut client).await.unwrap();

        assert!(!client.is_connected());
        assert_eq!(server.state().await, ServerState::Closed);
        assert_eq!(server.registered(), 0);
        assert_eq!(collect(&mut rx).await, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn test_sequential_cycles_restart_listener() {
        let (server, _rx) = inline_server();

        for _ in 0..3 {
            let mut client = server.register(SessionClient::new("t")).await.unwrap();
            assert_eq!(server.state().await, ServerState::Started);
            server.un_register(&mut client).await.unwrap();
            assert_eq!(server.state().await, ServerState::Closed);
        }
    }

    #[tokio::test]
    async fn test_overlapping_registrations_share_listener() {
        let (server, _rx) = inline_server();

        let mut first = server.register(SessionClient::new("a")).await.unwrap();
        let addr = server.local_addr().await.unwrap();
        let mut second = server.register(SessionClient::new("b")).await.unwrap();
        assert_eq!(server.local_addr().await, Some(addr));
        assert_eq!(server.registered(), 2);

        server.un_register(&mut first).await.unwrap();
        assert_eq!(server.state().await, ServerState::Started);

        server.un_register(&mut second).await.unwrap();
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_launch_failure_releases_registration() {
        let server = SessionServer::new(&config(), FailingLauncher);

        let err = server.register(SessionClient::new("t")).await.unwrap_err();
        assert!(matches!(err, SessionError::Launch(_)));
        assert_eq!(server.registered(), 0);
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_register_times_out() {
        let (tx, _addr_rx) = mpsc::unbounded_channel();
        let config = RendezvousConfig {
            port: 0,
            timeout_secs: 1,
            ..RendezvousConfig::default()
        };
        let server = SessionServer::new(&config, ManualLauncher { addr: tx });

        let err = server.register(SessionClient::new("t")).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert_eq!(server.registered(), 0);
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_key_is_rejected_and_registration_survives() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = Arc::new(SessionServer::new(&config(), ManualLauncher { addr: tx }));
        let client = SessionClient::new("t");
        let key = client.security_key().clone();

        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(client).await })
        };
        let addr = addr_rx.recv().await.unwrap();

        let mut stray = TcpStream::connect(addr).await.unwrap();
        stray
            .write_all(&encode_handshake(&SecurityKey::generate("other")))
            .await
            .unwrap();
        let mut buf = Vec::new();
        stray.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(b"not a key\n").await.unwrap();
        garbage.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        assert_eq!(server.registered(), 1);

        let mut terminal = TcpStream::connect(addr).await.unwrap();
        terminal.write_all(&encode_handshake(&key)).await.unwrap();

        let mut client = registering.await.unwrap().unwrap();
        assert!(client.is_connected());
        server.un_register(&mut client).await.unwrap();
    }

    #[tokio::test]
    async fn test_key_is_single_use() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = Arc::new(SessionServer::new(&config(), ManualLauncher { addr: tx }));
        let client = SessionClient::new("t");
        let key = client.security_key().clone();

        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(client).await })
        };
        let addr = addr_rx.recv().await.unwrap();

        let mut terminal = TcpStream::connect(addr).await.unwrap();
        terminal.write_all(&encode_handshake(&key)).await.unwrap();
        let mut client = registering.await.unwrap().unwrap();

        let mut replay = TcpStream::connect(addr).await.unwrap();
        replay.write_all(&encode_handshake(&key)).await.unwrap();
        let mut buf = Vec::new();
        replay.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        client.write_all(b"still here").await.unwrap();
        server.un_register(&mut client).await.unwrap();

        terminal.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"still here");
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_register() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = Arc::new(SessionServer::new(&config(), ManualLauncher { addr: tx }));
        let client = SessionClient::new("t");
        let key = client.security_key().clone();

        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(client).await })
        };
        addr_rx.recv().await.unwrap();

        server.cancel(&key).await.unwrap();
        let err = registering.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_register_releases_and_stops() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = SessionServer::new(&config(), ManualLauncher { addr: tx });

        let result =
            tokio::time::timeout(Duration::from_millis(200), server.register(SessionClient::new("t")))
                .await;
        assert!(result.is_err());
        assert!(addr_rx.recv().await.is_some());

        assert_eq!(server.registered(), 0);
        assert_eq!(server.state().await, ServerState::Closed);
        assert_eq!(server.local_addr().await, None);

        // The next registration starts a fresh listener
        let client = SessionClient::new("again");
        let key = client.security_key().clone();
        let server = Arc::new(server);
        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(client).await })
        };
        let addr = addr_rx.recv().await.unwrap();
        let mut terminal = TcpStream::connect(addr).await.unwrap();
        terminal.write_all(&encode_handshake(&key)).await.unwrap();

        let mut client = registering.await.unwrap().unwrap();
        server.un_register(&mut client).await.unwrap();
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_register_keeps_other_registrations() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = Arc::new(SessionServer::new(&config(), ManualLauncher { addr: tx }));
        let survivor = SessionClient::new("survivor");
        let key = survivor.security_key().clone();

        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(survivor).await })
        };
        let addr = addr_rx.recv().await.unwrap();

        let dropped =
            tokio::time::timeout(Duration::from_millis(100), server.register(SessionClient::new("gone")))
                .await;
        assert!(dropped.is_err());
        assert_eq!(server.registered(), 1);
        assert_eq!(server.state().await, ServerState::Started);

        let mut terminal = TcpStream::connect(addr).await.unwrap();
        terminal.write_all(&encode_handshake(&key)).await.unwrap();
        let mut client = registering.await.unwrap().unwrap();
        server.un_register(&mut client).await.unwrap();
        assert_eq!(server.state().await, ServerState::Closed);
    }

    #[tokio::test]
    async fn test_bytes_after_handshake_are_kept() {
        let (tx, mut addr_rx) = mpsc::unbounded_channel();
        let server = Arc::new(SessionServer::new(&config(), ManualLauncher { addr: tx }));
        let client = SessionClient::new("t");
        let key = client.security_key().clone();

        let registering = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.register(client).await })
        };
        let addr = addr_rx.recv().await.unwrap();

        let mut terminal = TcpStream::connect(addr).await.unwrap();
        let mut first = encode_handshake(&key);
        first.extend_from_slice(b"typed ahead\n");
        terminal.write_all(&first).await.unwrap();

        let mut client = registering.await.unwrap().unwrap();
        let mut line = String::new();
        client
            .connection_mut()
            .unwrap()
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line, "typed ahead\n");
        server.un_register(&mut client).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_closed() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RendezvousConfig {
            port: occupied.local_addr().unwrap().port(),
            ..RendezvousConfig::default()
        };
        let (launcher, _rx) = InlineLauncher::new();
        let server = SessionServer::new(&config, launcher);

        let err = server.register(SessionClient::new("t")).await.unwrap_err();
        assert!(matches!(err, SessionError::Bind { .. }));
        assert_eq!(server.state().await, ServerState::Closed);
        assert_eq!(server.registered(), 0);
    }
}
