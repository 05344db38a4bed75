//! Broker transport engine.
//!
//! Data flow: broker → consume channel → [`Task`] → inbound queue → worker →
//! outbound queue → publish channel → broker. The [`ConnectionManager`]
//! owns the reactor; the two [`WorkQueue`]s are the only things shared with
//! other threads.

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod connection;
pub mod error;
pub mod message;
pub mod queue;
pub mod synapse;
pub mod task;
pub mod tracker;

pub use amqp::{AmqpConnector, AmqpSettings};
pub use broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEvent, ChannelRole, Confirmation,
    DeliveryProperties, EventSender, InboundDelivery, OutboundEnvelope,
};
pub use channel::{ChannelManager, ChannelState};
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, SessionHandler, StopHandle,
};
pub use error::TransportError;
pub use message::{
    Action, IncomingMessage, MalformedMessageError, Message, MsgType, OutgoingMessage,
};
pub use queue::WorkQueue;
pub use synapse::{StaticRoutes, Synapse, SynapseSettings};
pub use task::{Destination, Task};
pub use tracker::DeliveryTracker;

/// The assembled engine: connection manager driving the consume/publish
/// protocols.
pub type AmqpSynapse = ConnectionManager<Synapse>;
