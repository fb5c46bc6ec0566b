//! Worker configuration loading and validation (config.toml).

pub mod config;
pub mod policy;
pub mod validate;

pub use config::{
    AdmissionConfig, CONFIG_ENV, Config, NotifyConfig, ProviderConfig, ProviderKind, QueueConfig,
    StatusConfig, StoreConfig, resolve_path, secret_from_env,
};
pub use policy::{ModelPolicy, PolicyTable};
pub use validate::validate_config;
