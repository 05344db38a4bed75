use crate::transport::{
    AmqpSettings, ConnectionSettings, Destination, StaticRoutes, SynapseSettings,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Default location of the agent configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/synapse-agent/config.toml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "SYNAPSE_CONFIG";

/// Resolve the config path: explicit flag, then `SYNAPSE_CONFIG`, then the
/// system default.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ── Top-level config ──────────────────────────────────────────────

/// Agent configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from; not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ── Broker ────────────────────────────────────────────────────────

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    5672
}

fn default_ssl_port() -> u16 {
    5671
}

fn default_vhost() -> String {
    "/".into()
}

fn default_guest() -> String {
    "guest".into()
}

fn default_inbox() -> String {
    "inbox".into()
}

fn default_heartbeat_secs() -> u16 {
    30
}

fn default_connection_attempts() -> u32 {
    5000
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_redelivery_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_publish_batch_size() -> usize {
    10
}

/// Broker connection and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port used instead of `port` when `use_ssl` is set.
    #[serde(default = "default_ssl_port")]
    pub ssl_port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
    /// Authenticate with a client certificate (SASL EXTERNAL) instead of
    /// username/password.
    #[serde(default)]
    pub ssl_auth: bool,
    /// PEM bundle of trusted CAs.
    #[serde(default)]
    pub cacertfile: Option<PathBuf>,
    /// PKCS#12 client identity used with `ssl_auth`.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub identity_password: String,
    /// Agent identity. Generated on first start when empty.
    #[serde(default)]
    pub uuid: String,
    /// Inbound queue. Defaults to `uuid`.
    #[serde(default)]
    pub queue: String,
    #[serde(default = "default_inbox")]
    pub publish_exchange: String,
    #[serde(default)]
    pub publish_routing_key: String,
    #[serde(default = "default_inbox")]
    pub status_exchange: String,
    #[serde(default)]
    pub status_routing_key: String,
    #[serde(default)]
    pub compliance_routing_key: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat: u16,
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,
    /// Seconds between connection attempts and before reopening a channel.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay: u64,
    /// Seconds to wait for a publisher confirm before republishing.
    #[serde(default = "default_redelivery_timeout_secs")]
    pub redelivery_timeout: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl_port: default_ssl_port(),
            vhost: default_vhost(),
            username: default_guest(),
            password: default_guest(),
            use_ssl: false,
            ssl_auth: false,
            cacertfile: None,
            identity_file: None,
            identity_password: String::new(),
            uuid: String::new(),
            queue: String::new(),
            publish_exchange: default_inbox(),
            publish_routing_key: String::new(),
            status_exchange: default_inbox(),
            status_routing_key: String::new(),
            compliance_routing_key: String::new(),
            heartbeat: default_heartbeat_secs(),
            connection_attempts: default_connection_attempts(),
            retry_delay: default_retry_delay_secs(),
            redelivery_timeout: default_redelivery_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            publish_batch_size: default_publish_batch_size(),
        }
    }
}

/// Empty exchange and routing key together mean "not configured".
fn route(exchange: &str, routing_key: &str) -> Option<Destination> {
    if exchange.is_empty() && routing_key.is_empty() {
        None
    } else {
        Some(Destination::new(exchange, routing_key))
    }
}

impl BrokerConfig {
    pub fn queue_name(&self) -> &str {
        if self.queue.is_empty() {
            &self.uuid
        } else {
            &self.queue
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.use_ssl {
            self.ssl_port
        } else {
            self.port
        }
    }

    pub fn static_routes(&self) -> StaticRoutes {
        StaticRoutes {
            publish: route(&self.publish_exchange, &self.publish_routing_key),
            status: route(&self.status_exchange, &self.status_routing_key),
            compliance: route(&self.status_exchange, &self.compliance_routing_key),
        }
    }

    pub fn amqp_settings(&self) -> AmqpSettings {
        AmqpSettings {
            host: self.host.clone(),
            port: self.effective_port(),
            vhost: self.vhost.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            use_ssl: self.use_ssl,
            ssl_auth: self.ssl_auth,
            heartbeat: self.heartbeat,
            cacertfile: self.cacertfile.clone(),
            identity_file: self.identity_file.clone(),
            identity_password: self.identity_password.clone(),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let tick = Duration::from_millis(self.poll_interval_ms);
        ConnectionSettings {
            retry_delay: Duration::from_secs(self.retry_delay),
            connection_attempts: self.connection_attempts,
            publish_interval: tick,
            redelivery_check_interval: tick,
        }
    }

    pub fn synapse_settings(&self) -> SynapseSettings {
        SynapseSettings {
            queue: self.queue_name().to_string(),
            consumer_tag: self.uuid.clone(),
            agent_id: self.uuid.clone(),
            // The broker checks user_id against the authenticated user, which
            // is the certificate subject under EXTERNAL auth.
            user_id: (!self.ssl_auth).then(|| self.username.clone()),
            batch_size: self.publish_batch_size,
            redelivery_timeout: Duration::from_secs(self.redelivery_timeout),
            routes: self.static_routes(),
        }
    }
}

// ── Controller / log / daemon ─────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Resources to leave out of the capability table.
    #[serde(default)]
    pub ignored_resources: Vec<String>,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/synapse-agent/state.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where the health snapshot is flushed.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load `path`, or write a default config there if it does not exist.
    ///
    /// A missing agent identity is generated and persisted before env
    /// overrides are applied, so overrides never leak into the file.
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            path,
                            meta.permissions().mode() & 0o777,
                            path,
                        );
                    }
                }
            }
            let contents = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.config_path = path.to_path_buf();
            if config.ensure_identity() {
                config.save().await?;
            }
            config
        } else {
            let mut config = Config {
                config_path: path.to_path_buf(),
                ..Config::default()
            };
            config.ensure_identity();
            config.save().await?;
            tracing::info!(path = %path.display(), "Wrote default config");
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            uuid = %config.broker.uuid,
            "Config loaded"
        );
        Ok(config)
    }

    /// Generate an agent identity if none is set. Returns whether one was
    /// generated.
    pub fn ensure_identity(&mut self) -> bool {
        if self.broker.uuid.trim().is_empty() {
            self.broker.uuid = uuid::Uuid::new_v4().to_string();
            true
        } else {
            false
        }
    }

    /// Validate values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            anyhow::bail!("broker.host must not be empty");
        }
        if broker.effective_port() == 0 {
            anyhow::bail!("broker port must be greater than 0");
        }
        if broker.uuid.trim().is_empty() {
            anyhow::bail!("broker.uuid must not be empty");
        }
        if broker.queue_name().trim().is_empty() {
            anyhow::bail!("broker.queue must not be empty");
        }
        if broker.connection_attempts == 0 {
            anyhow::bail!("broker.connection_attempts must be greater than 0");
        }
        if broker.redelivery_timeout == 0 {
            anyhow::bail!("broker.redelivery_timeout must be greater than 0");
        }
        if broker.poll_interval_ms == 0 {
            anyhow::bail!("broker.poll_interval_ms must be greater than 0");
        }
        if broker.publish_batch_size == 0 {
            anyhow::bail!("broker.publish_batch_size must be greater than 0");
        }
        if broker.ssl_auth && !broker.use_ssl {
            anyhow::bail!("broker.ssl_auth requires broker.use_ssl");
        }
        if broker.ssl_auth && broker.identity_file.is_none() {
            anyhow::bail!("broker.ssl_auth requires broker.identity_file");
        }
        if self.log.level.trim().is_empty() {
            anyhow::bail!("log.level must not be empty");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an explicit lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(host) = value("SYNAPSE_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(vhost) = value("SYNAPSE_BROKER_VHOST") {
            self.broker.vhost = vhost;
        }
        if let Some(username) = value("SYNAPSE_BROKER_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = value("SYNAPSE_BROKER_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(uuid) = value("SYNAPSE_UUID") {
            self.broker.uuid = uuid;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write the config atomically, owner-only.
    pub async fn save(&self) -> Result<()> {
        let toml_str = self.to_toml()?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            fs::set_permissions(&temp_path, Permissions::from_mode(0o600))
                .await
                .context("Failed to restrict config file permissions")?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
