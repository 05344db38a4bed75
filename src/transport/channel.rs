use super::broker::{BrokerChannel, BrokerConnection, ChannelRole, CONNECTION_FORCED};
use super::error::{Result, TransportError};
use std::time::Duration;
use tokio::time::Instant;

/// Prefetch limit applied to every channel: one unacknowledged delivery in
/// flight at a time.
pub const PREFETCH_COUNT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Open/close state machine for one channel role.
///
/// Each successful `open` bumps the generation; broker events tagged with an
/// older generation belong to a channel that no longer exists.
pub struct ChannelManager {
    role: ChannelRole,
    state: ChannelState,
    generation: u64,
    channel: Option<Box<dyn BrokerChannel>>,
    reopen_at: Option<Instant>,
}

impl ChannelManager {
    pub fn new(role: ChannelRole) -> Self {
        Self {
            role,
            state: ChannelState::Unopened,
            generation: 0,
            channel: None,
            reopen_at: None,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// The live channel while it is being set up or is open.
    pub fn channel(&self) -> Option<&dyn BrokerChannel> {
        match self.state {
            ChannelState::Opening | ChannelState::Open => self.channel.as_deref(),
            _ => None,
        }
    }

    /// Whether an event tagged with `generation` concerns the live channel.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
            && matches!(self.state, ChannelState::Opening | ChannelState::Open)
    }

    pub fn reopen_at(&self) -> Option<Instant> {
        self.reopen_at
    }

    pub fn reopen_due(&self, now: Instant) -> bool {
        self.state == ChannelState::Closed && self.reopen_at.is_some_and(|at| at <= now)
    }

    /// Open a channel and apply the prefetch limit. The manager stays in
    /// `Opening` until role setup succeeds and [`ChannelManager::mark_open`]
    /// is called.
    pub async fn open(&mut self, connection: &dyn BrokerConnection) -> Result<()> {
        self.state = ChannelState::Opening;
        self.reopen_at = None;
        self.generation += 1;

        let channel = match connection.open_channel(self.role, self.generation).await {
            Ok(channel) => channel,
            Err(e) => {
                self.state = ChannelState::Closed;
                return Err(e);
            }
        };
        if let Err(e) = channel.set_prefetch(PREFETCH_COUNT).await {
            self.state = ChannelState::Closed;
            return Err(e);
        }
        self.channel = Some(channel);
        Ok(())
    }

    pub fn mark_open(&mut self) {
        if self.state == ChannelState::Opening {
            self.state = ChannelState::Open;
            tracing::info!(
                "transport: {} channel open (generation {})",
                self.role,
                self.generation
            );
        }
    }

    /// Handle a broker-initiated close.
    ///
    /// Returns `Ok(false)` for events about a channel we no longer own or
    /// already closed ourselves, `Ok(true)` when a reopen was scheduled.
    /// A connection-forced close is fatal.
    pub fn closed(
        &mut self,
        generation: u64,
        code: u16,
        text: &str,
        now: Instant,
        retry_delay: Duration,
    ) -> Result<bool> {
        if !self.is_current(generation) {
            tracing::debug!(
                "transport: ignoring close of stale {} channel (generation {generation}, current {})",
                self.role,
                self.generation
            );
            return Ok(false);
        }
        self.channel = None;
        self.state = ChannelState::Closed;

        if code == CONNECTION_FORCED {
            tracing::error!(
                "transport: {} channel closed by broker ({code}): {text}",
                self.role
            );
            return Err(TransportError::ChannelClosed {
                role: self.role,
                code,
                text: text.to_string(),
            });
        }

        tracing::warn!(
            "transport: {} channel closed ({code}): {text}; reopening in {}s",
            self.role,
            retry_delay.as_secs_f64()
        );
        self.reopen_at = Some(now + retry_delay);
        Ok(true)
    }

    /// Give up on the current channel after a failed operation and schedule a
    /// reopen. The broker-side channel is closed best-effort.
    pub async fn fail(&mut self, now: Instant, retry_delay: Duration) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    tracing::debug!("transport: closing failed {} channel: {e}", self.role);
                }
            }
        }
        self.state = ChannelState::Closed;
        self.reopen_at = Some(now + retry_delay);
    }

    /// Whether an open channel is still alive according to the client.
    pub fn is_alive(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// Orderly close requested by us.
    pub async fn close(&mut self) {
        self.reopen_at = None;
        let Some(channel) = self.channel.take() else {
            self.state = ChannelState::Closed;
            return;
        };
        self.state = ChannelState::Closing;
        if channel.is_open() {
            match channel.close().await {
                Ok(()) => tracing::info!("transport: {} channel closed", self.role),
                Err(e) => tracing::warn!("transport: closing {} channel: {e}", self.role),
            }
        }
        self.state = ChannelState::Closed;
    }

    /// Forget the channel after its connection died.
    pub fn reset(&mut self) {
        self.channel = None;
        self.reopen_at = None;
        self.state = ChannelState::Closed;
    }
}
