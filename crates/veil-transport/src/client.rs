//! Reconnecting Veil client.
//!
//! The client is a small state machine driven by one background task:
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                     │   ▲              │
//!       │                 fail│   │retry         │ abnormal close /
//!       │                     ▼   │              │ heartbeat timeout
//!       └──── disconnect ─── Reconnecting ◀──────┘
//! ```
//!
//! A clean close from the server returns to `Disconnected` without
//! reconnecting; an explicit disconnect is honoured from any state and
//! abandons a pending reconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use veil_protocol::{ClientFrame, ServerFrame};

use crate::backoff::Backoff;
use crate::traits::{Connection, Connector, TransportError};

/// Connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Something that moves the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit connect request.
    Connect,
    /// Handshake completed.
    HandshakeSucceeded,
    /// Handshake failed.
    HandshakeFailed,
    /// The server closed the connection cleanly.
    CleanClose,
    /// The connection dropped or closed with an error.
    AbnormalClose,
    /// No pong arrived in time.
    HeartbeatTimeout,
    /// The backoff delay elapsed.
    RetryElapsed,
    /// Explicit disconnect request.
    Disconnect,
}

impl ConnectionState {
    /// The state reached from `self` on `trigger`, or `None` if the trigger
    /// does not apply in this state.
    #[must_use]
    pub fn on(self, trigger: Trigger) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, trigger) {
            (_, Trigger::Disconnect) => Some(Disconnected),
            (Disconnected, Trigger::Connect) => Some(Connecting),
            (Connecting, Trigger::HandshakeSucceeded) => Some(Connected),
            (Connecting, Trigger::HandshakeFailed) => Some(Reconnecting),
            (Connected, Trigger::CleanClose) => Some(Disconnected),
            (Connected, Trigger::AbnormalClose | Trigger::HeartbeatTimeout) => Some(Reconnecting),
            (Reconnecting, Trigger::RetryElapsed) => Some(Connecting),
            _ => None,
        }
    }
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A frame arrived from the server. Pongs are consumed by the heartbeat.
    Frame(ServerFrame),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconnect backoff.
    pub backoff: Backoff,
    /// Interval between pings while connected.
    pub ping_interval: Duration,
    /// How long to wait for a pong before reconnecting.
    pub pong_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send(ClientFrame),
}

/// Handle to a reconnecting client.
///
/// Dropping the handle stops the background task.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    driver: JoinHandle<()>,
}

impl Client {
    /// Spawn a client. Returns the handle and the event stream.
    ///
    /// The client starts `Disconnected`; call [`Client::connect`].
    #[must_use]
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            connector,
            config,
            state: state_tx,
            events: events_tx,
            commands: commands_rx,
            connection: None,
            attempts: 0,
        };

        let client = Self {
            commands: commands_tx,
            state: state_rx,
            driver: tokio::spawn(driver.run()),
        };
        (client, events_rx)
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Start connecting. Ignored unless disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task has stopped.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.command(Command::Connect)
    }

    /// Close the connection and stop reconnecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task has stopped.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.command(Command::Disconnect)
    }

    /// Join a room.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless connected.
    pub fn join(
        &self,
        room: impl Into<String>,
        identity: Option<String>,
        lang: Option<String>,
    ) -> Result<(), TransportError> {
        self.send(ClientFrame::join(room, identity, lang))
    }

    /// Leave a room.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless connected.
    pub fn leave(&self, room: impl Into<String>) -> Result<(), TransportError> {
        self.send(ClientFrame::leave(room))
    }

    /// Send an encrypted payload to a room.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless connected.
    pub fn send_message(
        &self,
        room: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.send(ClientFrame::message(room, payload))
    }

    /// Acknowledge a message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless connected.
    pub fn ack(
        &self,
        room: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.send(ClientFrame::ack(room, message_id))
    }

    fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.command(Command::Send(frame))
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Stopped)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Background task owning the connection.
struct Driver {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    connection: Option<Box<dyn Connection>>,
    attempts: u32,
}

impl Driver {
    async fn run(mut self) {
        loop {
            // Copy out so the watch guard is not held across an await.
            let state = *self.state.borrow();
            let running = match state {
                ConnectionState::Disconnected => self.idle().await,
                ConnectionState::Connecting => self.handshake().await,
                ConnectionState::Connected => self.connected().await,
                ConnectionState::Reconnecting => self.backoff().await,
            };
            if !running {
                break;
            }
        }
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close().await;
        }
        debug!("Client task stopped");
    }

    fn fire(&mut self, trigger: Trigger) {
        let from = *self.state.borrow();
        let Some(to) = from.on(trigger) else {
            return;
        };
        if trigger == Trigger::HandshakeSucceeded {
            self.attempts = 0;
        }
        if from != to {
            info!(%from, %to, ?trigger, "Connection state changed");
            self.state.send_replace(to);
            let _ = self.events.send(ClientEvent::StateChanged { from, to });
        }
    }

    /// Disconnected: wait for a connect request.
    async fn idle(&mut self) -> bool {
        match self.commands.recv().await {
            None => false,
            Some(Command::Connect) => {
                self.fire(Trigger::Connect);
                true
            }
            Some(Command::Disconnect) => true,
            Some(Command::Send(frame)) => {
                debug!(kind = frame.kind(), "Dropping frame, not connected");
                true
            }
        }
    }

    /// Connecting: run the handshake, abandoning it on disconnect.
    async fn handshake(&mut self) -> bool {
        let connector = Arc::clone(&self.connector);
        let connect = connector.connect();
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok(connection) => {
                            self.connection = Some(connection);
                            self.fire(Trigger::HandshakeSucceeded);
                        }
                        Err(e) => {
                            warn!(transport = connector.name(), error = %e, "Connect failed");
                            self.fire(Trigger::HandshakeFailed);
                        }
                    }
                    return true;
                }
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Disconnect) => {
                        self.fire(Trigger::Disconnect);
                        return true;
                    }
                    Some(_) => {}
                },
            }
        }
    }

    /// Connected: pump frames and run the heartbeat.
    async fn connected(&mut self) -> bool {
        let Some(mut connection) = self.connection.take() else {
            self.fire(Trigger::AbnormalClose);
            return true;
        };

        let interval = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            tokio::select! {
                received = connection.recv() => match received {
                    Ok(Some(ServerFrame::Pong {})) => {
                        pong_deadline = None;
                    }
                    Ok(Some(frame)) => {
                        let _ = self.events.send(ClientEvent::Frame(frame));
                    }
                    Ok(None) => {
                        debug!("Server closed connection cleanly");
                        self.fire(Trigger::CleanClose);
                        return true;
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection lost");
                        self.fire(Trigger::AbnormalClose);
                        return true;
                    }
                },
                command = self.commands.recv() => match command {
                    None => {
                        let _ = connection.close().await;
                        return false;
                    }
                    Some(Command::Disconnect) => {
                        let _ = connection.close().await;
                        self.fire(Trigger::Disconnect);
                        return true;
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Send(frame)) => {
                        if let Err(e) = connection.send(&frame).await {
                            warn!(error = %e, "Send failed");
                            self.fire(Trigger::AbnormalClose);
                            return true;
                        }
                    }
                },
                _ = ping.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = connection.send(&ClientFrame::ping()).await {
                            warn!(error = %e, "Ping failed");
                            self.fire(Trigger::AbnormalClose);
                            return true;
                        }
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("Pong timeout, reconnecting");
                    let _ = connection.close().await;
                    self.fire(Trigger::HeartbeatTimeout);
                    return true;
                }
            }
        }
    }

    /// Reconnecting: wait out the backoff delay unless told to stop.
    async fn backoff(&mut self) -> bool {
        let delay = self.config.backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        debug!(attempt = self.attempts, ?delay, "Scheduling reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    self.fire(Trigger::RetryElapsed);
                    return true;
                }
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Disconnect) => {
                        self.fire(Trigger::Disconnect);
                        return true;
                    }
                    Some(_) => {}
                },
            }
        }
    }
}
