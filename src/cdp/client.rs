use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::error::CdpError;
use super::transport::{ConnectedWatch, TransportCommand, TransportHandle, spawn_transport};
use super::types::CdpEvent;

/// Tuning for a CDP connection.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the WebSocket handshake (default 10 s).
    pub connect_timeout: Duration,
    /// Per-command response deadline (default 30 s).
    pub command_timeout: Duration,
    /// Capacity of the command and event channels (default 256).
    pub channel_capacity: usize,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// A browser-level CDP connection.
///
/// Owns the transport task. Target-scoped work goes through [`CdpSession`]s
/// created with [`attach`](Self::attach); they share this connection.
#[derive(Debug)]
pub struct CdpClient {
    handle: TransportHandle,
    config: CdpConfig,
    url: String,
}

impl CdpClient {
    /// Connect to a browser-level CDP WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` if the handshake fails or
    /// `CdpError::ConnectTimeout` if it exceeds the configured timeout.
    pub async fn connect(url: &str, config: CdpConfig) -> Result<Self, CdpError> {
        let handle =
            spawn_transport(url, config.channel_capacity, config.connect_timeout).await?;
        Ok(Self {
            handle,
            config,
            url: url.to_owned(),
        })
    }

    /// Send a browser-level command.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CommandTimeout`, `CdpError::Protocol`, or
    /// `CdpError::Closed`.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        send_on(&self.handle, self.config.command_timeout, method, params, None).await
    }

    /// Subscribe to browser-level events matching `method`.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_on(&self.handle, self.config.channel_capacity, method, None).await
    }

    /// Attach to a target, creating a flattened session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` if the target refuses the attach, or
    /// `CdpError::InvalidResponse` if the response lacks a session id.
    pub async fn attach(&self, target_id: &str) -> Result<CdpSession, CdpError> {
        let result = self
            .send(
                "Target.attachToTarget",
                Some(serde_json::json!({ "targetId": target_id, "flatten": true })),
            )
            .await?;
        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| {
                CdpError::InvalidResponse("Target.attachToTarget response missing sessionId".into())
            })?
            .to_owned();
        Ok(CdpSession {
            session_id,
            target_id: target_id.to_owned(),
            handle: self.handle.clone(),
            config: self.config.clone(),
        })
    }

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if the transport task has already exited.
    pub async fn close(&self) -> Result<(), CdpError> {
        self.handle.send(TransportCommand::Shutdown).await
    }

    /// Whether the socket is currently up.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.is_connected()
    }

    /// Watch that flips to `false` when the connection dies.
    #[must_use]
    pub fn connected_watch(&self) -> ConnectedWatch {
        self.handle.connected_watch()
    }

    /// The WebSocket URL of this connection.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A session bound to one target (page), sharing the browser connection.
#[derive(Debug, Clone)]
pub struct CdpSession {
    session_id: String,
    target_id: String,
    handle: TransportHandle,
    config: CdpConfig,
}

impl CdpSession {
    /// Send a command scoped to this session.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`CdpClient::send`].
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        send_on(
            &self.handle,
            self.config.command_timeout,
            method,
            params,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Send a command with an explicit deadline instead of the default.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`CdpClient::send`].
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, CdpError> {
        send_on(
            &self.handle,
            timeout,
            method,
            params,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Subscribe to events scoped to this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_on(
            &self.handle,
            self.config.channel_capacity,
            method,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Detach this session from its target (browser-level command).
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` if the session is already gone.
    pub async fn detach(&self) -> Result<(), CdpError> {
        send_on(
            &self.handle,
            self.config.command_timeout,
            "Target.detachFromTarget",
            Some(serde_json::json!({ "sessionId": self.session_id })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Whether the underlying connection is up.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.is_connected()
    }

    /// The CDP session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The target this session is attached to.
    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }
}

async fn send_on(
    handle: &TransportHandle,
    command_timeout: Duration,
    method: &str,
    params: Option<serde_json::Value>,
    session_id: Option<String>,
) -> Result<serde_json::Value, CdpError> {
    let command = super::types::CdpCommand {
        id: handle.next_message_id(),
        method: method.to_owned(),
        params,
        session_id,
    };
    let (response_tx, response_rx) = oneshot::channel();
    handle
        .send(TransportCommand::Send {
            command,
            response_tx,
            deadline: Instant::now() + command_timeout,
        })
        .await?;
    response_rx.await.map_err(|_| CdpError::Closed)?
}

async fn subscribe_on(
    handle: &TransportHandle,
    channel_capacity: usize,
    method: &str,
    session_id: Option<String>,
) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
    let (event_tx, event_rx) = mpsc::channel(channel_capacity);
    handle
        .send(TransportCommand::Subscribe {
            method: method.to_owned(),
            session_id,
            event_tx,
        })
        .await?;
    Ok(event_rx)
}
