use super::{Resource, ResourceError};
use crate::transport::message::AGENT_VERSION;
use crate::transport::{Action, IncomingMessage};
use serde_json::{json, Value};

/// Facts about the machine the agent runs on. Read-only.
pub struct HostsResource {
    agent_id: String,
}

impl HostsResource {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

impl Resource for HostsResource {
    fn collection(&self) -> &str {
        "hosts"
    }

    fn process(&self, message: &IncomingMessage) -> Result<Value, ResourceError> {
        if message.action() != Action::Read {
            return Err(ResourceError::UnsupportedAction {
                collection: self.collection().to_string(),
                action: message.action(),
            });
        }
        let hostname = hostname::get()
            .map_err(|e| ResourceError::Failed(format!("reading hostname: {e}")))?
            .to_string_lossy()
            .into_owned();

        Ok(json!({
            "hostname": hostname,
            "os": std::env::consts::OS,
            "family": std::env::consts::FAMILY,
            "arch": std::env::consts::ARCH,
            "agent_version": AGENT_VERSION,
            "uuid": self.agent_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(action: &str) -> IncomingMessage {
        IncomingMessage::from_value(json!({"collection": "hosts", "action": action})).unwrap()
    }

    #[test]
    fn read_reports_host_facts() {
        let status = HostsResource::new("agent-1").process(&message("read")).unwrap();
        assert!(!status["hostname"].as_str().unwrap().is_empty());
        assert_eq!(status["os"], std::env::consts::OS);
        assert_eq!(status["uuid"], "agent-1");
    }

    #[test]
    fn writes_are_rejected() {
        let err = HostsResource::new("agent-1")
            .process(&message("update"))
            .unwrap_err();
        assert!(matches!(err, ResourceError::UnsupportedAction { .. }));
    }
}
