use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::error::CdpError;
use super::types::{CdpCommand, CdpEvent, Incoming, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscriber routing key: (method, session id).
type SubscriberKey = (String, Option<String>);

/// Watch over the transport's connected state.
///
/// Flips to `false` exactly once, when the socket dies or is shut down. The
/// session plane observes this to drive its connected→failed transition; the
/// transport itself never reconnects (re-entry happens one level up, via a
/// fresh `launch`/`connect` from the failed state).
pub type ConnectedWatch = watch::Receiver<bool>;

/// Command sent from client handles to the transport task.
pub enum TransportCommand {
    /// Send a CDP command; the response is delivered via the oneshot.
    Send {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    },
    /// Register an event subscription.
    Subscribe {
        method: String,
        session_id: Option<String>,
        event_tx: mpsc::Sender<CdpEvent>,
    },
    /// Close the socket and exit.
    Shutdown,
}

/// An in-flight command awaiting its response.
struct Pending {
    response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle to the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected_rx: ConnectedWatch,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Forward a command to the transport task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if the task has exited.
    pub async fn send(&self, cmd: TransportCommand) -> Result<(), CdpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| CdpError::Closed)
    }

    /// Current connected state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// A watch that flips to `false` when the connection dies.
    #[must_use]
    pub fn connected_watch(&self) -> ConnectedWatch {
        self.connected_rx.clone()
    }

    /// Next unique message id for this connection.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Establish the WebSocket connection and spawn the transport task.
///
/// # Errors
///
/// Returns `CdpError::Connection` if the handshake fails or
/// `CdpError::ConnectTimeout` if it exceeds `connect_timeout`.
pub async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    connect_timeout: Duration,
) -> Result<TransportHandle, CdpError> {
    let ws_stream = connect_ws(url, connect_timeout).await?;
    let (connected_tx, connected_rx) = watch::channel(true);
    let (command_tx, command_rx) = mpsc::channel(channel_capacity);

    let handle = TransportHandle {
        command_tx,
        connected_rx,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            connected_tx,
        };
        task.run().await;
    });

    Ok(handle)
}

async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CdpError::Connection(e.to_string())),
        Err(_) => Err(CdpError::ConnectTimeout),
    }
}

/// Background task owning the WebSocket stream.
struct TransportTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    pending: HashMap<u64, Pending>,
    subscribers: HashMap<SubscriberKey, Vec<mpsc::Sender<CdpEvent>>>,
    connected_tx: watch::Sender<bool>,
}

impl TransportTask {
    async fn run(&mut self) {
        let alive = loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let deadline_sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => self.route_text(&text),
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break false,
                        Some(Ok(_)) => {
                            // Binary / Ping / Pong / Frame: nothing to route.
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Send { command, response_tx, deadline }) => {
                            self.write_command(command, response_tx, deadline).await;
                        }
                        Some(TransportCommand::Subscribe { method, session_id, event_tx }) => {
                            self.subscribers
                                .entry((method, session_id))
                                .or_default()
                                .push(event_tx);
                        }
                        Some(TransportCommand::Shutdown) | None => break true,
                    }
                }

                () = deadline_sleep => self.expire_deadlines(),
            }
        };

        // Either a graceful shutdown or a dead socket; in both cases every
        // outstanding and future command resolves with Closed.
        self.drain_pending();
        self.subscribers.clear();
        if alive {
            let _ = self.ws_stream.close(None).await;
        }
        let _ = self.connected_tx.send(false);

        // Hold the command channel open so late senders get a Closed error
        // instead of a channel failure, until every handle is dropped.
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                TransportCommand::Send { response_tx, .. } => {
                    let _ = response_tx.send(Err(CdpError::Closed));
                }
                TransportCommand::Subscribe { .. } => {}
                TransportCommand::Shutdown => break,
            }
        }
    }

    fn route_text(&mut self, text: &str) {
        let Ok(raw) = serde_json::from_str::<WireMessage>(text) else {
            debug!("dropping malformed CDP frame");
            return;
        };
        match raw.into_incoming() {
            Some(Incoming::Response(response)) => {
                if let Some(pending) = self.pending.remove(&response.id) {
                    let result = response.result.map_err(|e| CdpError::Protocol {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = pending.response_tx.send(result);
                }
            }
            Some(Incoming::Event(event)) => self.fan_out(&event),
            None => {}
        }
    }

    fn fan_out(&mut self, event: &CdpEvent) {
        let key = (event.method.clone(), event.session_id.clone());
        if let Some(senders) = self.subscribers.get_mut(&key) {
            senders.retain(|tx| !tx.is_closed() && tx.try_send(event.clone()).is_ok());
            if senders.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    async fn write_command(
        &mut self,
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    ) {
        let id = command.id;
        let method = command.method.clone();

        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(CdpError::Internal(format!(
                    "command serialization failed: {e}"
                ))));
                return;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(CdpError::Connection(format!(
                "WebSocket write failed: {e}"
            ))));
            return;
        }

        self.pending.insert(
            id,
            Pending {
                response_tx,
                method,
                deadline,
            },
        );
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(CdpError::CommandTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    fn drain_pending(&mut self) {
        for (_, req) in std::mem::take(&mut self.pending) {
            let _ = req.response_tx.send(Err(CdpError::Closed));
        }
    }
}
