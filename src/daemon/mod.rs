use crate::config::Config;
use crate::controller::{Controller, ResourceRegistry};
use crate::transport::{AmqpConnector, ConnectionManager, Synapse, TransportError, WorkQueue};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATUS_FLUSH_SECONDS: u64 = 5;

/// Run the agent until SIGINT/SIGTERM or a fatal transport error.
///
/// Shutdown order: close the inbound queue so the controller drains and
/// exits, then stop the transport and wait for its reactor to finish.
pub async fn run(config: Config) -> Result<()> {
    crate::health::mark_component_ok("daemon");

    let agent_id = config.broker.uuid.clone();
    let inbound = WorkQueue::new();
    let outbound = WorkQueue::new();

    let registry = Arc::new(ResourceRegistry::with_builtin(
        &agent_id,
        &config.controller.ignored_resources,
    ));
    let controller = Controller::new(registry, agent_id.as_str(), inbound.clone(), outbound.clone())
        .spawn()
        .context("Failed to start controller thread")?;

    let connector = Arc::new(
        AmqpConnector::new(config.broker.amqp_settings())
            .context("Invalid broker TLS configuration")?,
    );
    let synapse = Synapse::new(config.broker.synapse_settings(), inbound.clone(), outbound);
    let mut engine = ConnectionManager::new(connector, config.broker.connection_settings(), synapse);
    let stop = engine.stop_handle();

    let (exited_tx, exited_rx) = tokio::sync::oneshot::channel::<()>();
    let transport = std::thread::Builder::new()
        .name("synapse-transport".to_string())
        .spawn(move || {
            let result = engine.run();
            let _ = exited_tx.send(());
            result
        })
        .context("Failed to start transport thread")?;

    let state_writer = spawn_state_writer(config.daemon.state_file.clone());

    println!("🔌 synapse-agent started");
    println!("   Agent:   {agent_id}");
    println!(
        "   Broker:  {}:{}{}",
        config.broker.host,
        config.broker.effective_port(),
        config.broker.vhost
    );
    println!("   Queue:   {}", config.broker.queue_name());
    println!("   Ctrl+C to stop");

    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            tracing::info!("Shutdown requested");
        }
        _ = exited_rx => {
            tracing::warn!("Transport exited; shutting down");
        }
    }
    crate::health::mark_component_error("daemon", "shutdown requested");

    inbound.close();
    match tokio::task::spawn_blocking(move || controller.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::error!("Controller thread panicked"),
        Err(e) => tracing::error!("Failed to join controller thread: {e}"),
    }

    stop.stop();
    let outcome = tokio::task::spawn_blocking(move || transport.join())
        .await
        .context("Failed to join transport thread")?;

    state_writer.abort();
    let _ = state_writer.await;
    write_state(&config.daemon.state_file).await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(transport_failure(e)),
        Err(_) => anyhow::bail!("transport thread panicked"),
    }
}

fn transport_failure(error: TransportError) -> anyhow::Error {
    let fatal = error.is_fatal();
    anyhow::Error::new(error).context(if fatal {
        "Broker transport stopped on a fatal error"
    } else {
        "Broker transport failed"
    })
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        Ok(())
    }
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config.daemon.state_file.clone()
}

/// Last health snapshot flushed by a running daemon.
pub fn read_state(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).with_context(|| {
        format!(
            "state file not found: {} (is the agent running?)",
            path.display()
        )
    })?;
    serde_json::from_str(&raw).context("invalid state JSON")
}

async fn write_state(path: &Path) {
    let mut json = crate::health::snapshot_json();
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
    if let Err(e) = tokio::fs::write(path, data).await {
        tracing::debug!("Failed to write state file {}: {e}", path.display());
    }
}

fn spawn_state_writer(path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            write_state(&path).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn state_file_path_comes_from_daemon_section() {
        let mut config = Config::default();
        config.daemon.state_file = PathBuf::from("/run/synapse/state.json");
        assert_eq!(
            state_file_path(&config),
            PathBuf::from("/run/synapse/state.json")
        );
    }

    #[tokio::test]
    async fn state_writer_flushes_health_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("state.json");
        crate::health::mark_component_ok("daemon-test-writer");

        let handle = spawn_state_writer(path.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        let _ = handle.await;

        let state = read_state(&path).unwrap();
        assert!(state["written_at"].is_string());
        assert_eq!(
            state["components"]["daemon-test-writer"]["status"],
            "ok"
        );
    }

    #[test]
    fn missing_state_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let err = read_state(&tmp.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("is the agent running"));
    }

    #[test]
    fn fatal_transport_errors_are_labelled() {
        let err = transport_failure(TransportError::ConnectionClosed {
            code: 403,
            text: "ACCESS_REFUSED".into(),
        });
        assert!(err.to_string().contains("fatal"));
        assert!(format!("{err:#}").contains("ACCESS_REFUSED"));
    }
}
