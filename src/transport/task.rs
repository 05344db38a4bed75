use super::broker::DeliveryProperties;
use super::message::{IncomingMessage, Message, MsgType, OutgoingMessage};
use std::fmt;

/// Exchange and routing key a message is published to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Reply address carried by an inbound delivery, if any.
    ///
    /// `reply_to` names a routing key on the `reply_exchange` header (or the
    /// default exchange). A bare `reply_exchange` header routes with an
    /// empty key.
    pub fn from_properties(properties: &DeliveryProperties) -> Option<Self> {
        let reply_to = properties.reply_to.as_deref().filter(|s| !s.is_empty());
        let exchange = properties
            .reply_exchange
            .as_deref()
            .filter(|s| !s.is_empty());
        match (exchange, reply_to) {
            (exchange, Some(reply_to)) => Some(Self::new(exchange.unwrap_or_default(), reply_to)),
            (Some(exchange), None) => Some(Self::new(exchange, "")),
            (None, None) => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exchange = if self.exchange.is_empty() {
            "(default)"
        } else {
            &self.exchange
        };
        write!(f, "{exchange}/{}", self.routing_key)
    }
}

/// A message plus the transport metadata needed to route its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    message: Message,
    sender: String,
    correlation_id: Option<String>,
    delivery_tag: Option<u64>,
    destination: Option<Destination>,
    redeliver: bool,
}

impl Task {
    /// Task for a command just received on the consume channel.
    pub fn from_delivery(
        message: IncomingMessage,
        delivery_tag: u64,
        properties: &DeliveryProperties,
    ) -> Self {
        Self {
            message: Message::Incoming(message),
            sender: properties.user_id.clone().unwrap_or_default(),
            correlation_id: properties.correlation_id.clone(),
            delivery_tag: Some(delivery_tag),
            destination: Destination::from_properties(properties),
            redeliver: false,
        }
    }

    /// Unsolicited event (alert, status, compliance) with no originating
    /// command.
    pub fn outgoing(message: OutgoingMessage) -> Self {
        Self {
            message: Message::Outgoing(message),
            sender: String::new(),
            correlation_id: None,
            delivery_tag: None,
            destination: None,
            redeliver: true,
        }
    }

    /// Reply to this task. The reply inherits the correlation id, the
    /// pending delivery tag and the reply address.
    pub fn reply(&self, message: OutgoingMessage) -> Self {
        Self {
            message: Message::Outgoing(message),
            sender: self.sender.clone(),
            correlation_id: self.correlation_id.clone(),
            delivery_tag: self.delivery_tag,
            destination: self.destination.clone(),
            redeliver: true,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Fire-and-forget: no delivery record, no republish.
    pub fn without_redelivery(mut self) -> Self {
        self.redeliver = false;
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn incoming(&self) -> Option<&IncomingMessage> {
        match &self.message {
            Message::Incoming(message) => Some(message),
            Message::Outgoing(_) => None,
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.message.msg_type()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    /// Take the pending delivery tag; a republished copy must not ack twice.
    pub(crate) fn take_delivery_tag(&mut self) -> Option<u64> {
        self.delivery_tag.take()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn redeliver(&self) -> bool {
        self.redeliver
    }
}
