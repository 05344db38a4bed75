//! Broker client seam.
//!
//! The connection manager only ever talks to these traits. Everything the
//! broker tells us asynchronously arrives as a [`BrokerEvent`] on one
//! unbounded channel that the reactor drains.

use super::error::Result;
use super::task::Destination;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Normal close.
pub const REPLY_SUCCESS: u16 = 200;
/// The broker (or an operator) forced the connection closed.
pub const CONNECTION_FORCED: u16 = 320;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_ALLOWED: u16 = 530;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Consume,
    Publish,
}

impl ChannelRole {
    pub const ALL: [ChannelRole; 2] = [ChannelRole::Consume, ChannelRole::Publish];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport metadata read from an inbound delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub user_id: Option<String>,
    /// Custom `reply_exchange` header.
    pub reply_exchange: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: DeliveryProperties,
}

/// A fully resolved publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: Destination,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub app_id: String,
}

/// Publisher confirmation for one sequence number, or for every sequence
/// number up to it when `multiple` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub sequence: u64,
    pub multiple: bool,
    pub acked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Delivery {
        generation: u64,
        delivery: InboundDelivery,
    },
    Confirm {
        generation: u64,
        confirmation: Confirmation,
    },
    ChannelClosed {
        role: ChannelRole,
        generation: u64,
        code: u16,
        text: String,
    },
    ConnectionClosed {
        code: u16,
        text: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Opens logical connections to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Human-readable endpoint for log lines (no credentials).
    fn endpoint(&self) -> String;

    async fn connect(&self, events: EventSender) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel. Events raised on it must carry `generation`.
    async fn open_channel(
        &self,
        role: ChannelRole,
        generation: u64,
    ) -> Result<Box<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn start_consuming(&self, queue: &str, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn enable_confirms(&self) -> Result<()>;

    /// Publish with the given confirm sequence number. The confirmation, if
    /// any, arrives later as [`BrokerEvent::Confirm`].
    async fn publish(&self, sequence: u64, envelope: OutboundEnvelope) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
