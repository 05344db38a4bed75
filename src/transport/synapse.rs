//! Consume and publish protocols.
//!
//! [`Synapse`] sits between the broker channels and the two work queues:
//! commands flow from the consume channel onto the inbound queue, results
//! flow from the outbound queue onto the publish channel, and the inbound
//! delivery is acknowledged only once its reply is handed to the publish
//! path.

use super::broker::{ChannelRole, Confirmation, InboundDelivery, OutboundEnvelope};
use super::channel::ChannelManager;
use super::connection::SessionHandler;
use super::error::{Result, TransportError};
use super::message::{IncomingMessage, MsgType};
use super::queue::WorkQueue;
use super::task::{Destination, Task};
use super::tracker::DeliveryTracker;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Default destinations per message type, used when a task carries no reply
/// address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticRoutes {
    /// `response` and `alert`.
    pub publish: Option<Destination>,
    pub status: Option<Destination>,
    /// `compliance_ok` and `compliance_error`.
    pub compliance: Option<Destination>,
}

impl StaticRoutes {
    pub fn for_msg_type(&self, msg_type: MsgType) -> Option<&Destination> {
        match msg_type {
            MsgType::Response | MsgType::Alert => self.publish.as_ref(),
            MsgType::Status => self.status.as_ref(),
            MsgType::ComplianceOk | MsgType::ComplianceError => self.compliance.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynapseSettings {
    /// Inbound queue to declare and consume.
    pub queue: String,
    pub consumer_tag: String,
    /// Agent identity, sent as `app_id`.
    pub agent_id: String,
    /// Sent as `user_id`; must match the authenticated broker user.
    pub user_id: Option<String>,
    pub batch_size: usize,
    pub redelivery_timeout: Duration,
    pub routes: StaticRoutes,
}

pub struct Synapse {
    settings: SynapseSettings,
    inbound: WorkQueue<Task>,
    outbound: WorkQueue<Task>,
    tracker: DeliveryTracker,
    /// Delivery tags of commands whose reply has not been published yet.
    awaiting_reply: HashSet<u64>,
    next_sequence: u64,
    accepting: bool,
}

impl Synapse {
    pub fn new(
        settings: SynapseSettings,
        inbound: WorkQueue<Task>,
        outbound: WorkQueue<Task>,
    ) -> Self {
        Self {
            settings,
            inbound,
            outbound,
            tracker: DeliveryTracker::new(),
            awaiting_reply: HashSet::new(),
            next_sequence: 0,
            accepting: true,
        }
    }

    pub fn pending_confirmations(&self) -> usize {
        self.tracker.len()
    }

    pub fn awaiting_reply(&self) -> usize {
        self.awaiting_reply.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    fn requeue(&self, task: Task) {
        if !self.outbound.push(task) {
            tracing::warn!("synapse: outbound queue closed; dropping unconfirmed message");
        }
    }

    /// Acknowledge the command a reply belongs to.
    async fn ack_command(&mut self, tag: u64, consume: &ChannelManager) -> Result<()> {
        if !self.awaiting_reply.remove(&tag) {
            tracing::debug!(
                "synapse: delivery {tag} is from an earlier consume channel; broker will redeliver it"
            );
            return Ok(());
        }
        let Some(channel) = consume.channel().filter(|_| consume.is_open()) else {
            tracing::debug!("synapse: consume channel down; delivery {tag} left unacknowledged");
            return Ok(());
        };
        channel.ack(tag).await?;
        tracing::debug!("synapse: acknowledged delivery {tag}");
        Ok(())
    }

    fn resolve_destination(&self, task: &Task) -> Option<Destination> {
        task.destination().cloned().or_else(|| {
            task.msg_type()
                .and_then(|msg_type| self.settings.routes.for_msg_type(msg_type))
                .cloned()
        })
    }
}

#[async_trait]
impl SessionHandler for Synapse {
    async fn setup_channel(&mut self, manager: &ChannelManager) -> Result<()> {
        let role = manager.role();
        let channel = manager.channel().ok_or(TransportError::Operation {
            role,
            operation: "setup",
            reason: "channel is not open".into(),
        })?;

        match role {
            ChannelRole::Consume => {
                channel.declare_queue(&self.settings.queue).await?;
                channel
                    .start_consuming(&self.settings.queue, &self.settings.consumer_tag)
                    .await?;
                self.awaiting_reply.clear();
                tracing::info!("synapse: consuming from '{}'", self.settings.queue);
            }
            ChannelRole::Publish => {
                channel.enable_confirms().await?;
                self.next_sequence = 0;
                let stale = self.tracker.drain();
                if !stale.is_empty() {
                    tracing::info!(
                        "synapse: requeueing {} unconfirmed messages from previous publish channel",
                        stale.len()
                    );
                }
                for task in stale {
                    self.requeue(task);
                }
                tracing::info!("synapse: publisher confirms enabled");
            }
        }
        Ok(())
    }

    fn channel_lost(&mut self, role: ChannelRole) {
        if role == ChannelRole::Consume && !self.awaiting_reply.is_empty() {
            tracing::debug!(
                "synapse: forgetting {} deliveries awaiting reply",
                self.awaiting_reply.len()
            );
            self.awaiting_reply.clear();
        }
    }

    async fn handle_delivery(
        &mut self,
        delivery: InboundDelivery,
        consume: &ChannelManager,
    ) -> Result<()> {
        let tag = delivery.delivery_tag;
        let channel = consume.channel().ok_or(TransportError::Operation {
            role: ChannelRole::Consume,
            operation: "ack",
            reason: "channel is not open".into(),
        })?;

        if delivery.redelivered {
            tracing::info!("synapse: skipping redelivered message {tag}");
            return channel.ack(tag).await;
        }

        let message = match IncomingMessage::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("synapse: dropping message {tag}: {e}");
                return channel.ack(tag).await;
            }
        };

        tracing::debug!(
            "synapse: received {} {} (delivery {tag})",
            message.action(),
            message.collection()
        );
        let task = Task::from_delivery(message, tag, &delivery.properties);
        self.awaiting_reply.insert(tag);
        if !self.inbound.push(task) {
            self.awaiting_reply.remove(&tag);
            tracing::warn!("synapse: inbound queue closed; delivery {tag} left unacknowledged");
        }
        Ok(())
    }

    async fn publish_tick(
        &mut self,
        consume: &ChannelManager,
        publish: &ChannelManager,
    ) -> Result<()> {
        if !self.accepting {
            return Ok(());
        }
        let Some(channel) = publish.channel().filter(|_| publish.is_open()) else {
            return Ok(());
        };

        let mut consume_error = None;
        for _ in 0..self.settings.batch_size {
            let Some(mut task) = self.outbound.try_pop() else {
                break;
            };

            if let Some(tag) = task.take_delivery_tag() {
                if let Err(e) = self.ack_command(tag, consume).await {
                    tracing::warn!("synapse: acknowledging delivery {tag} failed: {e}");
                    consume_error.get_or_insert(e);
                }
            }

            let Some(destination) = self.resolve_destination(&task) else {
                tracing::warn!(
                    "synapse: undeliverable message for '{}': no reply-to and no default destination",
                    task.message().collection()
                );
                continue;
            };

            let body = match task.message().to_vec() {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("synapse: dropping unencodable message: {e}");
                    continue;
                }
            };

            self.next_sequence += 1;
            let sequence = self.next_sequence;
            let envelope = OutboundEnvelope {
                destination,
                body,
                correlation_id: task.correlation_id().map(str::to_string),
                user_id: self.settings.user_id.clone(),
                app_id: self.settings.agent_id.clone(),
            };
            let route = envelope.destination.to_string();

            if let Err(e) = channel.publish(sequence, envelope).await {
                if task.redeliver() {
                    self.requeue(task);
                }
                return Err(e);
            }
            tracing::debug!("synapse: published #{sequence} to {route}");
            if task.redeliver() {
                self.tracker.record(sequence, task, Instant::now());
            }
        }

        match consume_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn confirm(&mut self, confirmation: Confirmation) {
        let Confirmation {
            sequence,
            multiple,
            acked,
        } = confirmation;
        if acked {
            let settled = self.tracker.confirm(sequence, multiple);
            tracing::debug!("synapse: broker confirmed #{sequence} ({settled} settled)");
        } else {
            let rejected = self.tracker.reject(sequence, multiple);
            tracing::warn!(
                "synapse: broker rejected #{sequence}; republishing {} messages",
                rejected.len()
            );
            for task in rejected {
                self.requeue(task);
            }
        }
    }

    fn redelivery_tick(&mut self, now: Instant) {
        for task in self.tracker.expired(now, self.settings.redelivery_timeout) {
            tracing::debug!(
                "synapse: no confirmation within {}s; republishing",
                self.settings.redelivery_timeout.as_secs_f64()
            );
            self.requeue(task);
        }
    }

    fn shutdown(&mut self) {
        if self.accepting {
            tracing::info!(
                "synapse: shutting down with {} unconfirmed messages and {} commands awaiting reply",
                self.tracker.len(),
                self.awaiting_reply.len()
            );
        }
        self.accepting = false;
    }
}
