//! Per-invocation rendezvous client.

use rendezvous::{SecurityKey, StateMachine};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::SessionError;

/// A matched terminal connection.
///
/// Buffered so nothing the terminal sent after its handshake line is lost.
pub type Connection = BufReader<TcpStream>;

/// Connection state of a [`SessionClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No terminal is attached.
    Closed,
    /// A terminal presented the key and its socket is attached.
    Connected,
}

/// One interactive invocation's endpoint.
///
/// A client carries a fresh [`SecurityKey`] and, once registered, the socket
/// of the terminal that presented it.
#[derive(Debug)]
pub struct SessionClient {
    title: String,
    security_key: SecurityKey,
    state: StateMachine<ClientState>,
    connection: Option<Connection>,
}

impl SessionClient {
    /// Creates a closed client with a newly generated key.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let security_key = SecurityKey::generate(&title);
        Self {
            title,
            security_key,
            state: StateMachine::new(ClientState::Closed, "SessionClient"),
            connection: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn security_key(&self) -> &SecurityKey {
        &self.security_key
    }

    pub fn state(&self) -> ClientState {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state.check(ClientState::Connected)
    }

    /// Binds a matched connection. Only valid while closed.
    pub fn attach(&mut self, connection: Connection) -> Result<(), SessionError> {
        self.state
            .require(ClientState::Closed, ClientState::Connected)?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Shuts the connection down. Only valid while connected.
    pub async fn detach(&mut self) -> Result<(), SessionError> {
        self.state
            .require(ClientState::Connected, ClientState::Closed)?;

        if let Some(connection) = self.connection.take() {
            let mut stream = connection.into_inner();
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(
                    key = %self.security_key.fingerprint(),
                    error = %e,
                    "Terminal connection already closed"
                );
            }
        }
        Ok(())
    }

    /// Forwards bytes to the terminal.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(rendezvous::ProtocolError::NotConnected)?;
        let stream = connection.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Returns the connection, if attached.
    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }
}
