//! Worker that executes inbound commands against local resources.
//!
//! Runs on its own OS thread and blocks on the inbound queue. Every command
//! produces exactly one reply on the outbound queue; failures become error
//! responses and never reach the transport.

pub mod hosts;

use crate::transport::{Action, IncomingMessage, OutgoingMessage, Task, WorkQueue};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

const COMPONENT: &str = "controller";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("'{collection}' does not support '{action}'")]
    UnsupportedAction { collection: String, action: Action },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

/// A family of host resources addressable by `collection`.
pub trait Resource: Send + Sync {
    fn collection(&self) -> &str;

    /// Execute one command and return its status payload.
    fn process(&self, message: &IncomingMessage) -> Result<Value, ResourceError>;
}

/// Capability table built once at startup.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Box<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in resources minus the ignored ones.
    pub fn with_builtin(agent_id: &str, ignored: &[String]) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(hosts::HostsResource::new(agent_id)));
        for name in ignored {
            if registry.resources.remove(name).is_some() {
                tracing::info!("controller: resource '{name}' disabled");
            }
        }
        registry
    }

    pub fn register(&mut self, resource: Box<dyn Resource>) {
        let name = resource.collection().to_string();
        if self.resources.insert(name.clone(), resource).is_some() {
            tracing::warn!("controller: resource '{name}' registered twice; keeping the latest");
        }
    }

    pub fn get(&self, collection: &str) -> Option<&dyn Resource> {
        self.resources.get(collection).map(|resource| resource.as_ref())
    }

    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn dispatch(&self, message: &IncomingMessage) -> Result<Value, ResourceError> {
        let resource = self
            .get(message.collection())
            .ok_or_else(|| ResourceError::UnknownCollection(message.collection().to_string()))?;
        match catch_unwind(AssertUnwindSafe(|| resource.process(message))) {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                crate::health::mark_component_error(COMPONENT, format!("resource panicked: {reason}"));
                Err(ResourceError::Failed(format!(
                    "resource '{}' panicked: {reason}",
                    message.collection()
                )))
            }
        }
    }
}

pub struct Controller {
    registry: Arc<ResourceRegistry>,
    agent_id: String,
    inbound: WorkQueue<Task>,
    outbound: WorkQueue<Task>,
}

impl Controller {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        agent_id: impl Into<String>,
        inbound: WorkQueue<Task>,
        outbound: WorkQueue<Task>,
    ) -> Self {
        Self {
            registry,
            agent_id: agent_id.into(),
            inbound,
            outbound,
        }
    }

    /// Build the reply for one inbound task.
    pub fn handle(&self, task: &Task) -> Option<Task> {
        let Some(message) = task.incoming() else {
            tracing::warn!("controller: ignoring non-command task on inbound queue");
            return None;
        };

        let response = OutgoingMessage::response(self.agent_id.as_str())
            .with_collection(message.collection())
            .with_resource_id(message.id().unwrap_or_default());

        let response = match self.registry.dispatch(message) {
            Ok(status) => {
                tracing::debug!(
                    "controller: {} {} succeeded",
                    message.action(),
                    message.collection()
                );
                response.with_status(status)
            }
            Err(e) => {
                tracing::warn!(
                    "controller: {} {} failed: {e}",
                    message.action(),
                    message.collection()
                );
                response.with_error(e)
            }
        };
        Some(task.reply(response))
    }

    /// Process commands until the inbound queue is closed and drained.
    pub fn run(&self) {
        crate::health::mark_component_ok(COMPONENT);
        tracing::info!(
            "controller: serving collections {:?}",
            self.registry.collections()
        );
        while let Some(task) = self.inbound.pop() {
            if let Some(reply) = self.handle(&task) {
                if !self.outbound.push(reply) {
                    tracing::warn!("controller: outbound queue closed; reply dropped");
                }
            }
        }
        tracing::info!("controller: inbound queue closed, exiting");
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("synapse-controller".to_string())
            .spawn(move || self.run())
    }
}
