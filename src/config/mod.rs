use crate::executor::ThreadPoolProfile;
use crate::pool::{ExhaustedPolicy, PoolSettings};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Engine wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub endpoint_cache_size: usize,
    pub producer_pool: PoolConfig,
    pub consumer_pool: PoolConfig,
    pub shutdown_timeout_ms: u64,
    pub shutdown_abort_after_timeout: bool,
    pub thread_pool_profile: ThreadPoolProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::from("switchyard"),
            endpoint_cache_size: 1000,
            producer_pool: PoolConfig::default(),
            consumer_pool: PoolConfig::default(),
            shutdown_timeout_ms: 45_000,
            shutdown_abort_after_timeout: false,
            thread_pool_profile: ThreadPoolProfile::default(),
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    #[default]
    Fail,
    Block,
    CreateUnpooled,
}

/// Producer or consumer cache settings. A `maximum_cache_size` of 0 disables caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub maximum_cache_size: usize,
    pub capacity: usize,
    pub exhausted_policy: ExhaustedAction,
    pub block_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            maximum_cache_size: 1000,
            capacity: 100,
            exhausted_policy: ExhaustedAction::Fail,
            block_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn exhausted_policy(&self) -> ExhaustedPolicy {
        match self.exhausted_policy {
            ExhaustedAction::Fail => ExhaustedPolicy::Fail,
            ExhaustedAction::CreateUnpooled => ExhaustedPolicy::CreateUnpooled,
            ExhaustedAction::Block => ExhaustedPolicy::Block {
                timeout: self.block_timeout_ms.map(Duration::from_millis),
            },
        }
    }

    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            maximum_cache_size: self.maximum_cache_size,
            capacity: self.capacity,
            exhausted_policy: self.exhausted_policy(),
        }
    }
}

/// Scheduling and backoff settings of a scheduled poll consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledPollConfig {
    pub initial_delay_ms: u64,
    pub delay_ms: u64,
    /// Next run starts `delay` after the previous run finished, otherwise after it started.
    pub use_fixed_delay: bool,
    pub start_scheduler: bool,
    pub greedy: bool,
    pub send_empty_message_when_idle: bool,
    pub backoff_multiplier: u32,
    pub backoff_idle_threshold: u32,
    pub backoff_error_threshold: u32,
    /// Stop scheduling after this many runs, 0 runs forever.
    pub repeat_count: u64,
}

impl Default for ScheduledPollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            delay_ms: 500,
            use_fixed_delay: true,
            start_scheduler: true,
            greedy: false,
            send_empty_message_when_idle: false,
            backoff_multiplier: 0,
            backoff_idle_threshold: 0,
            backoff_error_threshold: 0,
            repeat_count: 0,
        }
    }
}

impl ScheduledPollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier > 0
            && self.backoff_idle_threshold == 0
            && self.backoff_error_threshold == 0
        {
            return Err(String::from(
                "backoff_idle_threshold and/or backoff_error_threshold must be configured when backoff_multiplier is set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Config<C> {
    config: C,
}

impl<C> Config<C>
where
    C: Default + DeserializeOwned,
{
    pub fn new(provider: &impl ConfigProvider<C>) -> Result<Self, ConfigProviderError> {
        provider.load().map(|config| Config { config })
    }

    pub fn get(&self) -> &C {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn into_inner(self) -> C {
        self.config
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(config_path).map_err(|e| {
            let msg = format!("Could not open config file: {}", e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not load config file from reader: {}", e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone + Serialize,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug)]
pub enum ConfigProviderError {
    #[error("Could not load config file. {message}")]
    Load { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }
}
