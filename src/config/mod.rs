pub mod schema;

pub use schema::{
    resolve_config_path, BrokerConfig, Config, ControllerConfig, DaemonConfig, LogConfig,
    CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH,
};
