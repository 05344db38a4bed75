//! Connection manager and reactor.
//!
//! One task owns the connection, both channel managers and the session
//! handler. Broker notifications, the two periodic timers, channel reopen
//! deadlines and the stop signal are multiplexed in a single `select!`, so
//! no state here is ever shared with another thread.

use super::broker::{
    BrokerConnection, BrokerConnector, BrokerEvent, ChannelRole, Confirmation, EventReceiver,
    InboundDelivery,
};
use super::channel::ChannelManager;
use super::error::{Result, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "transport";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Delay between connection attempts and before reopening a channel.
    pub retry_delay: Duration,
    /// Consecutive failed connection attempts tolerated before giving up.
    pub connection_attempts: u32,
    pub publish_interval: Duration,
    pub redelivery_check_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            connection_attempts: 5000,
            publish_interval: Duration::from_millis(100),
            redelivery_check_interval: Duration::from_millis(100),
        }
    }
}

/// Role-specific protocol run by the reactor on behalf of both channels.
#[async_trait]
pub trait SessionHandler: Send {
    /// Run the setup protocol for a freshly opened channel.
    async fn setup_channel(&mut self, channel: &ChannelManager) -> Result<()>;

    /// A channel went away (closed by the broker, failed, or its connection
    /// died).
    fn channel_lost(&mut self, role: ChannelRole);

    async fn handle_delivery(
        &mut self,
        delivery: InboundDelivery,
        consume: &ChannelManager,
    ) -> Result<()>;

    async fn publish_tick(
        &mut self,
        consume: &ChannelManager,
        publish: &ChannelManager,
    ) -> Result<()>;

    fn confirm(&mut self, confirmation: Confirmation);

    fn redelivery_tick(&mut self, now: Instant);

    /// Stop taking new outbound work.
    fn shutdown(&mut self);
}

/// Requests the reactor to stop. Cloneable, idempotent, usable from any
/// thread; returns before the reactor has drained.
#[derive(Clone, Debug)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        if !self.0.is_cancelled() {
            tracing::info!("transport: stop requested");
        }
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct ConnectionManager<H> {
    connector: Arc<dyn BrokerConnector>,
    settings: ConnectionSettings,
    state: ConnectionState,
    consume: ChannelManager,
    publish: ChannelManager,
    handler: H,
    stop: CancellationToken,
}

impl<H: SessionHandler> ConnectionManager<H> {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: ConnectionSettings, handler: H) -> Self {
        Self {
            connector,
            settings,
            state: ConnectionState::Idle,
            consume: ChannelManager::new(ChannelRole::Consume),
            publish: ChannelManager::new(ChannelRole::Publish),
            handler,
            stop: CancellationToken::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn channel(&self, role: ChannelRole) -> &ChannelManager {
        match role {
            ChannelRole::Consume => &self.consume,
            ChannelRole::Publish => &self.publish,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Block the calling thread inside a dedicated single-threaded reactor
    /// until stopped or a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_until_stopped())
    }

    /// Connect, serve, and reconnect until stopped.
    pub async fn run_until_stopped(&mut self) -> Result<()> {
        let stop = self.stop.clone();
        let endpoint = self.connector.endpoint();
        let mut attempts: u32 = 0;

        while !stop.is_cancelled() {
            self.state = ConnectionState::Connecting;
            let (events_tx, events_rx) = mpsc::unbounded_channel();

            let connected = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                result = self.connector.connect(events_tx) => result,
            };
            match connected {
                Ok(connection) => {
                    attempts = 0;
                    self.state = ConnectionState::Open;
                    tracing::info!("transport: connected to {endpoint}");
                    crate::health::mark_component_ok(COMPONENT);

                    let outcome = self.serve(connection.as_ref(), events_rx).await;
                    match outcome {
                        Ok(()) => break,
                        Err(e) if e.is_fatal() => {
                            tracing::error!("transport: fatal error, not reconnecting: {e}");
                            crate::health::mark_component_error(COMPONENT, e.to_string());
                            if let Err(close_err) = connection.close().await {
                                tracing::debug!("transport: closing connection: {close_err}");
                            }
                            self.connection_lost();
                            self.state = ConnectionState::Closed;
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "transport: connection to {endpoint} lost: {e}; reconnecting in {}s",
                                self.settings.retry_delay.as_secs_f64()
                            );
                            crate::health::mark_component_error(COMPONENT, e.to_string());
                            crate::health::bump_component_restart(COMPONENT);
                            self.connection_lost();
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("transport: connection to {endpoint} refused: {e}");
                    crate::health::mark_component_error(COMPONENT, e.to_string());
                    self.state = ConnectionState::Closed;
                    return Err(e);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::error!(
                        "transport: connecting to {endpoint} failed (attempt {attempts}/{}): {e}",
                        self.settings.connection_attempts
                    );
                    crate::health::mark_component_error(COMPONENT, e.to_string());
                    if attempts >= self.settings.connection_attempts {
                        self.state = ConnectionState::Closed;
                        return Err(TransportError::AttemptsExhausted {
                            attempts,
                            last: Box::new(e),
                        });
                    }
                }
            }

            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = sleep(self.settings.retry_delay) => {}
            }
        }

        self.handler.shutdown();
        self.state = ConnectionState::Closed;
        tracing::info!("transport: stopped");
        Ok(())
    }

    /// Drive one connection until it is lost, a fatal error occurs, or a stop
    /// is requested (`Ok`).
    async fn serve(
        &mut self,
        connection: &dyn BrokerConnection,
        mut events: EventReceiver,
    ) -> Result<()> {
        for role in ChannelRole::ALL {
            self.open_channel(connection, role).await?;
        }

        let stop = self.stop.clone();
        let mut publish_tick = interval(self.settings.publish_interval);
        publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut redelivery_tick = interval(self.settings.redelivery_check_interval);
        redelivery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reopen_at = self.next_reopen();
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    self.shutdown(connection).await;
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await?,
                    None => {
                        return Err(TransportError::ConnectionLost(
                            "broker event stream ended".into(),
                        ))
                    }
                },
                _ = publish_tick.tick() => self.on_publish_tick().await?,
                _ = redelivery_tick.tick() => self.handler.redelivery_tick(Instant::now()),
                () = sleep_until(reopen_at.unwrap_or_else(Instant::now)), if reopen_at.is_some() => {
                    self.reopen_due(connection).await?;
                }
            }
        }
    }

    async fn open_channel(
        &mut self,
        connection: &dyn BrokerConnection,
        role: ChannelRole,
    ) -> Result<()> {
        let retry_delay = self.settings.retry_delay;
        let (manager, handler) = match role {
            ChannelRole::Consume => (&mut self.consume, &mut self.handler),
            ChannelRole::Publish => (&mut self.publish, &mut self.handler),
        };

        let result = match manager.open(connection).await {
            Ok(()) => handler.setup_channel(manager).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                manager.mark_open();
                Ok(())
            }
            Err(e) if e.is_fatal() || e.is_connection_level() => Err(e),
            Err(e) => {
                tracing::warn!(
                    "transport: {role} channel setup failed: {e}; retrying in {}s",
                    retry_delay.as_secs_f64()
                );
                manager.fail(Instant::now(), retry_delay).await;
                handler.channel_lost(role);
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Delivery {
                generation,
                delivery,
            } => {
                if !self.consume.is_current(generation) {
                    tracing::debug!(
                        "transport: dropping delivery {} from stale consume channel",
                        delivery.delivery_tag
                    );
                    return Ok(());
                }
                if let Err(e) = self.handler.handle_delivery(delivery, &self.consume).await {
                    self.channel_failed(e).await?;
                }
            }
            BrokerEvent::Confirm {
                generation,
                confirmation,
            } => {
                if self.publish.is_current(generation) {
                    self.handler.confirm(confirmation);
                } else {
                    tracing::debug!(
                        "transport: dropping confirm {} from stale publish channel",
                        confirmation.sequence
                    );
                }
            }
            BrokerEvent::ChannelClosed {
                role,
                generation,
                code,
                text,
            } => {
                let retry_delay = self.settings.retry_delay;
                let manager = match role {
                    ChannelRole::Consume => &mut self.consume,
                    ChannelRole::Publish => &mut self.publish,
                };
                let scheduled = manager.closed(generation, code, &text, Instant::now(), retry_delay);
                match scheduled {
                    Ok(true) => self.handler.channel_lost(role),
                    Ok(false) => {}
                    Err(e) => {
                        self.handler.channel_lost(role);
                        return Err(e);
                    }
                }
            }
            BrokerEvent::ConnectionClosed { code, text } => {
                return Err(TransportError::ConnectionClosed { code, text });
            }
        }
        Ok(())
    }

    async fn on_publish_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let retry_delay = self.settings.retry_delay;
        for role in ChannelRole::ALL {
            let manager = match role {
                ChannelRole::Consume => &mut self.consume,
                ChannelRole::Publish => &mut self.publish,
            };
            if manager.is_open() && !manager.is_alive() {
                tracing::warn!(
                    "transport: {role} channel found closed; reopening in {}s",
                    retry_delay.as_secs_f64()
                );
                manager.fail(now, retry_delay).await;
                self.handler.channel_lost(role);
            }
        }

        if let Err(e) = self
            .handler
            .publish_tick(&self.consume, &self.publish)
            .await
        {
            self.channel_failed(e).await?;
        }
        Ok(())
    }

    /// Confine a handler error to its channel when possible.
    async fn channel_failed(&mut self, error: TransportError) -> Result<()> {
        if error.is_fatal() || error.is_connection_level() {
            return Err(error);
        }
        let Some(role) = error.channel_role() else {
            return Err(error);
        };
        let retry_delay = self.settings.retry_delay;
        tracing::warn!(
            "transport: {error}; reopening {role} channel in {}s",
            retry_delay.as_secs_f64()
        );
        let manager = match role {
            ChannelRole::Consume => &mut self.consume,
            ChannelRole::Publish => &mut self.publish,
        };
        manager.fail(Instant::now(), retry_delay).await;
        self.handler.channel_lost(role);
        Ok(())
    }

    fn next_reopen(&self) -> Option<Instant> {
        match (self.consume.reopen_at(), self.publish.reopen_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn reopen_due(&mut self, connection: &dyn BrokerConnection) -> Result<()> {
        let now = Instant::now();
        for role in ChannelRole::ALL {
            if self.channel(role).reopen_due(now) {
                tracing::info!("transport: reopening {role} channel");
                self.open_channel(connection, role).await?;
            }
        }
        Ok(())
    }

    fn connection_lost(&mut self) {
        for role in ChannelRole::ALL {
            match role {
                ChannelRole::Consume => self.consume.reset(),
                ChannelRole::Publish => self.publish.reset(),
            }
            self.handler.channel_lost(role);
        }
    }

    async fn shutdown(&mut self, connection: &dyn BrokerConnection) {
        self.state = ConnectionState::Closing;
        self.handler.shutdown();
        self.publish.close().await;
        self.consume.close().await;
        match connection.close().await {
            Ok(()) => tracing::info!("transport: connection closed"),
            Err(e) => tracing::warn!("transport: closing connection: {e}"),
        }
        self.state = ConnectionState::Closed;
    }
}
