//! Public client facade
//!
//! [`RealtimeClient`] spawns a driver task that owns the
//! [`ConnectionStateMachine`] and feeds it commands, session events and fired
//! timers from a single `select!` loop. All state changes therefore happen on
//! one task, in order; the facade only talks to it over channels.

use super::connection::{validate_endpoint, ClientNotice, ConnectionState, ConnectionStatus};
use super::dispatcher::{EventDispatcher, Subscriber, SubscriptionId};
use super::scheduler::{FiredTimer, TokioScheduler};
use super::state_machine::{ConnectionStateMachine, Input, StateMachineConfig};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::observability::metrics::{ClientMetrics, MetricsSnapshot};
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{Frame, SessionEventReceiver, SessionEventSender, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for the close handshake before dropping the session
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long shutdown waits for the driver task to finish
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

enum DriverCommand {
    Connect {
        endpoint: String,
    },
    Disconnect {
        reason: String,
    },
    Send {
        frame: Frame,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Shutdown,
}

/// Resilient real-time client for the risk stream backend
///
/// Must be created inside a Tokio runtime. Dropping the client aborts its
/// driver; call [`RealtimeClient::shutdown`] for a clean close.
pub struct RealtimeClient {
    config: ClientConfig,
    commands: mpsc::UnboundedSender<DriverCommand>,
    status: watch::Receiver<ConnectionStatus>,
    notices: broadcast::WeakSender<ClientNotice>,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<ClientMetrics>,
    driver: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    /// Create a client that connects over WebSocket
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        Self::with_transport(config, |events| Box::new(WebSocketTransport::new(events)))
    }

    /// Create a client over a custom transport
    ///
    /// `make_transport` receives the channel its sessions must report on.
    pub fn with_transport<F>(config: ClientConfig, make_transport: F) -> ClientResult<Self>
    where
        F: FnOnce(SessionEventSender) -> Box<dyn Transport>,
    {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (scheduler, timers) = TokioScheduler::new();
        let dispatcher = Arc::new(EventDispatcher::new());
        let metrics = Arc::new(ClientMetrics::new());

        let machine = ConnectionStateMachine::new(
            StateMachineConfig::from(&config),
            make_transport(events_tx),
            Box::new(scheduler),
            dispatcher.clone(),
            metrics.clone(),
        );
        let status = machine.status_receiver();
        let notices = machine.notice_sender().downgrade();

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run_driver(machine, commands_rx, events_rx, timers));

        Ok(Self {
            config,
            commands,
            status,
            notices,
            dispatcher,
            metrics,
            driver: Some(driver),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a connection cycle to `endpoint`
    ///
    /// Returns once the request is queued. A cycle that is already active is
    /// left untouched.
    pub fn connect(&self, endpoint: &str) -> ClientResult<()> {
        validate_endpoint(endpoint)?;
        self.command(DriverCommand::Connect {
            endpoint: endpoint.to_string(),
        })
    }

    /// Connect to the endpoint from the configuration
    pub fn connect_configured(&self) -> ClientResult<()> {
        self.connect(&self.config.client.endpoint)
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self, reason: &str) -> ClientResult<()> {
        self.command(DriverCommand::Disconnect {
            reason: reason.to_string(),
        })
    }

    /// Send a frame on the live session
    ///
    /// Fails with [`ClientError::NotConnected`] unless the client is
    /// `Connected`. Nothing is buffered for later delivery.
    pub async fn send(&self, frame: Frame) -> ClientResult<()> {
        let (reply, response) = oneshot::channel();
        self.command(DriverCommand::Send { frame, reply })?;
        response.await.map_err(|_| ClientError::DriverStopped)?
    }

    pub async fn send_text(&self, text: &str) -> ClientResult<()> {
        self.send(Frame::text(text)).await
    }

    /// Register `subscriber` for events of `topic`
    ///
    /// Subscriptions belong to the client, not to a session, so they
    /// survive reconnects.
    pub fn subscribe<S>(&self, topic: &str, subscriber: S) -> ClientResult<SubscriptionId>
    where
        S: Subscriber + 'static,
    {
        Ok(self.dispatcher.subscribe(topic, subscriber)?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Watch channel carrying every status change
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stream of lifecycle notices from this point on
    ///
    /// Once the driver has stopped the receiver reports `Closed`.
    pub fn notices(&self) -> broadcast::Receiver<ClientNotice> {
        match self.notices.upgrade() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Wait until the client reaches `state`
    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
        timeout: Duration,
    ) -> ClientResult<ConnectionStatus> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(timeout, async {
            status
                .wait_for(|current| current.state == state)
                .await
                .map(|current| *current)
        })
        .await;

        match waited {
            Ok(Ok(current)) => Ok(current),
            Ok(Err(_)) => Err(ClientError::DriverStopped),
            Err(_) => Err(ClientError::WaitTimeout {
                expected: state,
                observed: self.state(),
                waited: timeout,
            }),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Disconnect, wait briefly for the close handshake and stop the driver
    pub async fn shutdown(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        info!("Shutting down real-time client");

        if self.commands.send(DriverCommand::Shutdown).is_err() {
            debug!("Driver already stopped");
        }

        let abort = driver.abort_handle();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, driver).await {
            Ok(Ok(())) => debug!("Driver stopped"),
            Ok(Err(e)) => warn!(error = %e, "Driver task ended abnormally"),
            Err(_) => {
                warn!("Driver did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    fn command(&self, command: DriverCommand) -> ClientResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::DriverStopped)
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

async fn run_driver(
    mut machine: ConnectionStateMachine,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    mut events: SessionEventReceiver,
    mut timers: mpsc::UnboundedReceiver<FiredTimer>,
) {
    debug!("Client driver started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DriverCommand::Connect { endpoint }) => {
                    machine.handle(Input::Connect { endpoint });
                }
                Some(DriverCommand::Disconnect { reason }) => {
                    machine.handle(Input::Disconnect { reason });
                }
                Some(DriverCommand::Send { frame, reply }) => {
                    let _ = reply.send(machine.send(frame));
                }
                Some(DriverCommand::Shutdown) | None => break,
            },
            Some((generation, event)) = events.recv() => {
                machine.handle(Input::Session { generation, event });
            }
            Some(timer) = timers.recv() => {
                machine.handle(Input::Timer(timer));
            }
        }
    }

    machine.disconnect("client shutdown");
    drain_close(&mut machine, &mut events).await;
    debug!("Client driver stopped");
}

/// Let the closing session report `Closed`, up to [`CLOSE_GRACE`]
async fn drain_close(machine: &mut ConnectionStateMachine, events: &mut SessionEventReceiver) {
    let deadline = tokio::time::sleep(CLOSE_GRACE);
    tokio::pin!(deadline);

    while machine.has_session() {
        tokio::select! {
            event = events.recv() => match event {
                Some((generation, event)) => machine.handle(Input::Session { generation, event }),
                None => break,
            },
            _ = &mut deadline => {
                debug!("Close handshake did not finish in time");
                break;
            }
        }
    }
    machine.abandon_session();
}
