//! In-memory broker used by the transport integration tests.
//!
//! Models just enough of a real broker: one queue, prefetch-limited
//! dispatch, redelivery of unacknowledged messages when their channel dies,
//! publisher confirms (automatic or manual) and scripted connect failures.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use synapse::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEvent, ChannelRole, Confirmation,
    ConnectionManager, ConnectionSettings, DeliveryProperties, EventSender, InboundDelivery,
    OutboundEnvelope, StaticRoutes, StopHandle, Synapse, SynapseSettings, Task, TransportError,
    WorkQueue,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    properties: DeliveryProperties,
    redelivered: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub role: ChannelRole,
    pub generation: u64,
    pub connection: u32,
    pub opened_at: Instant,
    pub open: bool,
    pub prefetch: Option<u16>,
    pub consuming: bool,
    pub confirms: bool,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub sequence: u64,
    pub generation: u64,
    pub envelope: OutboundEnvelope,
}

impl Published {
    pub fn body(&self) -> Value {
        serde_json::from_slice(&self.envelope.body).expect("published body is JSON")
    }
}

#[derive(Default)]
struct State {
    connect_failures: VecDeque<TransportError>,
    always_fail: Option<TransportError>,
    hang_connects: bool,
    connects: u32,
    connection_id: u32,
    connection_alive: bool,
    events: Option<EventSender>,
    channels: Vec<ChannelRecord>,
    queue: VecDeque<QueuedMessage>,
    unacked: Vec<(u64, QueuedMessage)>,
    next_tag: u64,
    acks: Vec<u64>,
    published: Vec<Published>,
    auto_confirm: bool,
    declared: Vec<String>,
    closes: Vec<String>,
}

impl State {
    fn send(&self, event: BrokerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn consumer(&self) -> Option<&ChannelRecord> {
        self.channels
            .iter()
            .rev()
            .find(|c| c.role == ChannelRole::Consume && c.open && c.consuming)
    }

    fn current(&mut self, role: ChannelRole) -> Option<&mut ChannelRecord> {
        self.channels
            .iter_mut()
            .rev()
            .find(|c| c.role == role && c.open)
    }

    /// Hand out queued messages while the consumer is below its prefetch.
    fn dispatch(&mut self) {
        loop {
            let Some(consumer) = self.consumer() else {
                return;
            };
            let limit = usize::from(consumer.prefetch.unwrap_or(u16::MAX));
            let generation = consumer.generation;
            if self.unacked.len() >= limit {
                return;
            }
            let Some(message) = self.queue.pop_front() else {
                return;
            };
            self.next_tag += 1;
            let tag = self.next_tag;
            self.unacked.push((tag, message.clone()));
            self.send(BrokerEvent::Delivery {
                generation,
                delivery: InboundDelivery {
                    delivery_tag: tag,
                    redelivered: message.redelivered,
                    body: message.body,
                    properties: message.properties,
                },
            });
        }
    }

    /// Unacknowledged messages go back to the head of the queue.
    fn requeue_unacked(&mut self) {
        for (_, mut message) in self.unacked.drain(..).rev() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.state.lock().auto_confirm = true;
        broker
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn set_auto_confirm(&self, enabled: bool) {
        self.state.lock().auto_confirm = enabled;
    }

    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state.lock().connect_failures.extend(errors);
    }

    pub fn fail_every_connect(&self, error: TransportError) {
        self.state.lock().always_fail = Some(error);
    }

    /// Connection attempts never complete, as with an unreachable host.
    pub fn hang_every_connect(&self) {
        self.state.lock().hang_connects = true;
    }

    /// Put a message on the agent's queue.
    pub fn enqueue(&self, body: &[u8], properties: DeliveryProperties, redelivered: bool) {
        let mut state = self.state.lock();
        state.queue.push_back(QueuedMessage {
            body: body.to_vec(),
            properties,
            redelivered,
        });
        state.dispatch();
    }

    pub fn enqueue_command(&self, command: &Value, correlation_id: &str, reply_to: &str) {
        self.enqueue(
            command.to_string().as_bytes(),
            DeliveryProperties {
                correlation_id: Some(correlation_id.to_string()),
                reply_to: Some(reply_to.to_string()),
                user_id: Some("dispatcher".into()),
                reply_exchange: None,
            },
            false,
        );
    }

    /// Broker-initiated channel close.
    pub fn close_channel(&self, role: ChannelRole, code: u16, text: &str) {
        let mut state = self.state.lock();
        let Some(channel) = state.current(role) else {
            return;
        };
        channel.open = false;
        let generation = channel.generation;
        if role == ChannelRole::Consume {
            state.requeue_unacked();
        }
        state.send(BrokerEvent::ChannelClosed {
            role,
            generation,
            code,
            text: text.to_string(),
        });
    }

    /// Channel dies without the client being told.
    pub fn kill_channel_silently(&self, role: ChannelRole) {
        let mut state = self.state.lock();
        if let Some(channel) = state.current(role) {
            channel.open = false;
        }
        if role == ChannelRole::Consume {
            state.requeue_unacked();
        }
    }

    pub fn drop_connection(&self, code: u16, text: &str) {
        let mut state = self.state.lock();
        state.connection_alive = false;
        for channel in &mut state.channels {
            channel.open = false;
        }
        state.requeue_unacked();
        state.send(BrokerEvent::ConnectionClosed {
            code,
            text: text.to_string(),
        });
        state.events = None;
    }

    /// Manual publisher confirm on the current publish channel.
    pub fn confirm(&self, sequence: u64, acked: bool) {
        let state = self.state.lock();
        let generation = state
            .channels
            .iter()
            .rev()
            .find(|c| c.role == ChannelRole::Publish && c.open)
            .map_or(0, |c| c.generation);
        state.send(BrokerEvent::Confirm {
            generation,
            confirmation: Confirmation {
                sequence,
                multiple: false,
                acked,
            },
        });
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.lock().acks.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn channels(&self, role: ChannelRole) -> Vec<ChannelRecord> {
        self.state
            .lock()
            .channels
            .iter()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    pub fn declared(&self) -> Vec<String> {
        self.state.lock().declared.clone()
    }

    /// Client-initiated closes, in order ("publish", "consume", "connection").
    pub fn closes(&self) -> Vec<String> {
        self.state.lock().closes.clone()
    }
}

struct FakeConnector {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    fn endpoint(&self) -> String {
        "amqp://fake:5672/%2F".into()
    }

    async fn connect(&self, events: EventSender) -> Result<Box<dyn BrokerConnection>> {
        let hang = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.hang_connects
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = &state.always_fail {
            return Err(clone_error(error));
        }
        state.connection_id += 1;
        state.connection_alive = true;
        state.events = Some(events);
        Ok(Box::new(FakeConnection {
            id: state.connection_id,
            state: Arc::clone(&self.state),
        }))
    }
}

fn clone_error(error: &TransportError) -> TransportError {
    match error {
        TransportError::Connect {
            endpoint,
            code,
            reason,
        } => TransportError::Connect {
            endpoint: endpoint.clone(),
            code: *code,
            reason: reason.clone(),
        },
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

struct FakeConnection {
    id: u32,
    state: Arc<Mutex<State>>,
}

impl FakeConnection {
    fn alive(state: &State, id: u32) -> bool {
        state.connection_alive && state.connection_id == id
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(
        &self,
        role: ChannelRole,
        generation: u64,
    ) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.state.lock();
        if !Self::alive(&state, self.id) {
            return Err(TransportError::ConnectionLost("connection is gone".into()));
        }
        state.channels.push(ChannelRecord {
            role,
            generation,
            connection: self.id,
            opened_at: Instant::now(),
            open: true,
            prefetch: None,
            consuming: false,
            confirms: false,
        });
        Ok(Box::new(FakeChannel {
            index: state.channels.len() - 1,
            connection: self.id,
            role,
            generation,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if Self::alive(&state, self.id) {
            state.connection_alive = false;
            state.closes.push("connection".into());
            state.requeue_unacked();
        }
        Ok(())
    }
}

struct FakeChannel {
    index: usize,
    connection: u32,
    role: ChannelRole,
    generation: u64,
    state: Arc<Mutex<State>>,
}

impl FakeChannel {
    fn check(&self, state: &State, operation: &'static str) -> Result<()> {
        let open = state.channels[self.index].open
            && FakeConnection::alive(state, self.connection);
        if open {
            Ok(())
        } else {
            Err(TransportError::Operation {
                role: self.role,
                operation,
                reason: "channel is closed".into(),
            })
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "basic.qos")?;
        state.channels[self.index].prefetch = Some(count);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "queue.declare")?;
        state.declared.push(queue.to_string());
        Ok(())
    }

    async fn start_consuming(&self, _queue: &str, _consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "basic.consume")?;
        state.channels[self.index].consuming = true;
        state.dispatch();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "basic.ack")?;
        let before = state.unacked.len();
        state.unacked.retain(|(tag, _)| *tag != delivery_tag);
        if state.unacked.len() == before {
            state.channels[self.index].open = false;
            state.requeue_unacked();
            return Err(TransportError::ChannelClosed {
                role: self.role,
                code: 406,
                text: format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            });
        }
        state.acks.push(delivery_tag);
        state.dispatch();
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "confirm.select")?;
        state.channels[self.index].confirms = true;
        Ok(())
    }

    async fn publish(&self, sequence: u64, envelope: OutboundEnvelope) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, "basic.publish")?;
        state.published.push(Published {
            sequence,
            generation: self.generation,
            envelope,
        });
        if state.auto_confirm {
            state.send(BrokerEvent::Confirm {
                generation: self.generation,
                confirmation: Confirmation {
                    sequence,
                    multiple: false,
                    acked: true,
                },
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.channels[self.index].open && FakeConnection::alive(&state, self.connection)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.channels[self.index].open {
            state.channels[self.index].open = false;
            state.closes.push(self.role.to_string());
            if self.role == ChannelRole::Consume {
                state.requeue_unacked();
            }
        }
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const TICK: Duration = Duration::from_millis(100);
pub const REDELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        retry_delay: RETRY_DELAY,
        connection_attempts: 5000,
        publish_interval: TICK,
        redelivery_check_interval: TICK,
    }
}

pub fn synapse_settings(routes: StaticRoutes) -> SynapseSettings {
    SynapseSettings {
        queue: "agent-1".into(),
        consumer_tag: "agent-1".into(),
        agent_id: "agent-1".into(),
        user_id: Some("agent".into()),
        batch_size: 10,
        redelivery_timeout: REDELIVERY_TIMEOUT,
        routes,
    }
}

pub struct Harness {
    pub broker: FakeBroker,
    pub inbound: WorkQueue<Task>,
    pub outbound: WorkQueue<Task>,
    pub stop: StopHandle,
    handle: JoinHandle<(Result<()>, ConnectionManager<Synapse>)>,
}

impl Harness {
    pub fn start(broker: FakeBroker) -> Self {
        Self::start_with(broker, connection_settings(), StaticRoutes::default())
    }

    pub fn start_with(
        broker: FakeBroker,
        settings: ConnectionSettings,
        routes: StaticRoutes,
    ) -> Self {
        let inbound = WorkQueue::new();
        let outbound = WorkQueue::new();
        let synapse = Synapse::new(synapse_settings(routes), inbound.clone(), outbound.clone());
        let mut manager = ConnectionManager::new(broker.connector(), settings, synapse);
        let stop = manager.stop_handle();
        let handle = tokio::spawn(async move {
            let result = manager.run_until_stopped().await;
            (result, manager)
        });
        Self {
            broker,
            inbound,
            outbound,
            stop,
            handle,
        }
    }

    /// Request a stop and wait for the reactor to exit.
    pub async fn stop(self) -> (Result<()>, ConnectionManager<Synapse>) {
        self.stop.stop();
        self.join().await
    }

    /// Wait for the reactor to exit on its own.
    pub async fn join(self) -> (Result<()>, ConnectionManager<Synapse>) {
        self.handle.await.expect("transport task panicked")
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait (in virtual time) for the inbound queue to yield a task.
    pub async fn next_command(&self) -> Task {
        for _ in 0..1000 {
            if let Some(task) = self.inbound.try_pop() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no command reached the inbound queue");
    }
}

/// Poll `condition` every 10ms of virtual time, up to `limit`.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
