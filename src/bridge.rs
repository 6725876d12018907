//! The provider side of a call: one connection, one pump task, and an
//! observable connection status.

use crate::transport::{Connector, Credential, Frame, Link};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_ERROR_GRACE: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

pub type FrameHandler = Arc<dyn Fn(&Frame) -> Result<()> + Send + Sync>;
type Handlers = Arc<RwLock<Vec<FrameHandler>>>;
type StatusTx = Arc<watch::Sender<ConnectionStatus>>;

enum PumpCommand {
    Send(Frame),
    Close(oneshot::Sender<()>),
}

struct Pump {
    commands: mpsc::UnboundedSender<PumpCommand>,
    task: JoinHandle<()>,
}

/// Owns at most one provider connection at a time.
///
/// Status moves `idle -> connecting -> connected -> disconnecting -> idle`.
/// `error` is entered from a failed handshake or a broken socket and decays
/// back to `idle` after the grace period.
pub struct TransportBridge {
    connector: Arc<dyn Connector>,
    status: StatusTx,
    handlers: Handlers,
    pump: Option<Pump>,
    error_grace: Duration,
}

impl TransportBridge {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            connector,
            status: Arc::new(status),
            handlers: Arc::new(RwLock::new(Vec::new())),
            pump: None,
            error_grace: DEFAULT_ERROR_GRACE,
        }
    }

    #[must_use]
    pub const fn with_error_grace(mut self, grace: Duration) -> Self {
        self.error_grace = grace;
        self
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Register a handler for every inbound frame. Handlers run in
    /// registration order on the pump task; an `Err` is logged and delivery
    /// continues.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Frame) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Open the provider connection.
    ///
    /// # Errors
    /// Returns [`Error::Connection`] if the bridge is already connected, the
    /// credential has expired, or the handshake fails.
    pub async fn connect(&mut self, credential: &Credential) -> Result<()> {
        if self.pump.is_some() {
            return Err(Error::Connection("bridge already owns a live connection".to_string()));
        }
        if credential.is_expired() {
            tracing::warn!("Refusing to connect with an expired credential");
            enter_error(&self.status, self.error_grace);
            return Err(Error::Connection("credential has expired".to_string()));
        }

        self.status.send_replace(ConnectionStatus::Connecting);
        tracing::info!("Connecting to provider");

        let link = match self.connector.connect(credential).await {
            Ok(link) => link,
            Err(err) => {
                let err = err.into_connection();
                tracing::warn!("Provider handshake failed: {err}");
                enter_error(&self.status, self.error_grace);
                return Err(err);
            }
        };

        self.status.send_replace(ConnectionStatus::Connected);
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(
            link,
            rx,
            Arc::clone(&self.handlers),
            Arc::clone(&self.status),
            self.error_grace,
        ));
        self.pump = Some(Pump { commands, task });
        tracing::info!("Provider connection open");
        Ok(())
    }

    /// Queue a frame for the provider. Returns `false` and drops the frame
    /// when the connection is not open.
    pub fn send(&self, frame: Frame) -> bool {
        let status = self.status();
        match &self.pump {
            Some(pump) if status == ConnectionStatus::Connected => {
                if pump.commands.send(PumpCommand::Send(frame)).is_ok() {
                    true
                } else {
                    tracing::warn!("Provider pump has stopped, dropping frame");
                    false
                }
            }
            _ => {
                tracing::warn!("Dropping {} while the bridge is {status:?}", frame.summary());
                false
            }
        }
    }

    /// Close the connection. Safe to call in any state and more than once.
    pub async fn close(&mut self) {
        let Some(pump) = self.pump.take() else {
            self.status.send_if_modified(|current| {
                let changed = *current != ConnectionStatus::Idle;
                *current = ConnectionStatus::Idle;
                changed
            });
            return;
        };

        self.status.send_replace(ConnectionStatus::Disconnecting);
        let (done_tx, done_rx) = oneshot::channel();
        if pump.commands.send(PumpCommand::Close(done_tx)).is_ok()
            && tokio::time::timeout(CLOSE_TIMEOUT, done_rx).await.is_err()
        {
            tracing::warn!("Provider did not acknowledge close in time");
        }
        pump.task.abort();
        self.status.send_replace(ConnectionStatus::Idle);
        tracing::info!("Provider connection closed");
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.task.abort();
        }
    }
}

fn enter_error(status: &StatusTx, grace: Duration) {
    status.send_replace(ConnectionStatus::Error);
    let status = Arc::clone(status);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        status.send_if_modified(|current| {
            if *current == ConnectionStatus::Error {
                *current = ConnectionStatus::Idle;
                true
            } else {
                false
            }
        });
    });
}

fn dispatch(handlers: &Handlers, frame: &Frame) {
    tracing::debug!("Provider -> relay: {}", frame.summary());
    let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
    for handler in handlers.iter() {
        if let Err(err) = handler(frame) {
            tracing::warn!("Frame handler failed: {err}");
        }
    }
}

async fn pump(
    mut link: Box<dyn Link>,
    mut commands: mpsc::UnboundedReceiver<PumpCommand>,
    handlers: Handlers,
    status: StatusTx,
    grace: Duration,
) {
    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(PumpCommand::Send(frame)) => {
                        tracing::debug!("Relay -> provider: {}", frame.summary());
                        if let Err(err) = link.send(frame).await {
                            tracing::warn!("Provider send failed: {err}");
                            enter_error(&status, grace);
                            return;
                        }
                    }
                    Some(PumpCommand::Close(done)) => {
                        if let Err(err) = link.close().await {
                            tracing::debug!("Provider close returned {err}");
                        }
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        let _ = link.close().await;
                        return;
                    }
                }
            }
            frame = link.next_frame() => {
                match frame {
                    Ok(Some(frame)) => dispatch(&handlers, &frame),
                    Ok(None) => {
                        tracing::info!("Provider closed the connection");
                        status.send_replace(ConnectionStatus::Idle);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!("Provider connection failed: {err}");
                        enter_error(&status, grace);
                        return;
                    }
                }
            }
        }
    }
}
