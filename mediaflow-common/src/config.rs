// Copyright 2024-2025 Mediaflow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix recognized by every Mediaflow binary; nested
/// keys are split on `__`, e.g. `MEDIAFLOW__REDIS__HOST`.
const ENV_PREFIX: &str = "MEDIAFLOW__";

pub struct ConfigExample<T> {
    pub name: &'static str,
    pub config: T,
}

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

pub enum ConfigOutcome<T> {
    Loaded(T),
    /// A `--dump-config*` flag was handled; the caller should exit normally.
    Dumped,
    Invalid(figment::Error),
}

/// Layered configuration loader: struct defaults, then the TOML file, then
/// `MEDIAFLOW__*` environment overrides.
pub struct ConfigLoader<T: Debug + Default + Serialize + DeserializeOwned> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
}

impl<T: Debug + Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    fn dump(config: &T) {
        match toml::to_string(config) {
            Ok(serialized) => println!("{serialized}"),
            Err(err) => eprintln!("Failed to serialize config: {err}"),
        }
    }

    /// Handles the `--dump-config` / `--dump-config-default` /
    /// `--dump-config-examples` flags, otherwise loads the layered config.
    pub fn load_or_dump_config(&self) -> ConfigOutcome<T> {
        let args: Vec<String> = std::env::args().collect();
        if args.iter().any(|arg| arg == "--dump-config-default") {
            Self::dump(&T::default());
            return ConfigOutcome::Dumped;
        }
        if args.iter().any(|arg| arg == "--dump-config-examples") {
            if let Some(make_examples) = self.make_examples {
                for example in make_examples() {
                    println!("# example: {}", example.name);
                    Self::dump(&example.config);
                }
            } else {
                Self::dump(&T::default());
            }
            return ConfigOutcome::Dumped;
        }
        match self.load() {
            Ok(config) => {
                if args.iter().any(|arg| arg == "--dump-config") {
                    Self::dump(&config);
                    ConfigOutcome::Dumped
                } else {
                    ConfigOutcome::Loaded(config)
                }
            }
            Err(err) => ConfigOutcome::Invalid(err),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-based attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.min_delay.mul_f64(factor.max(1.0));
        delay.min(self.max_delay)
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {:?}", self.min_delay);
        let _ = writeln!(&mut result, "max delay: {:?}", self.max_delay);
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub key_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub retries: RetryConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            key_prefix: "".to_string(),
            username: None,
            password: None,
            retries: RetryConfig::default(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!("{username}:{password}@"),
            (None, Some(password)) => format!(":{password}@"),
            _ => "".to_string(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
    }
}

impl SafeDisplay for RedisConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "key prefix: {}", self.key_prefix);
        let _ = writeln!(&mut result, "username: {:?}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

/// Root of the shared filesystem mounted by the gateway and every worker.
/// Per-task files live under `<root>/workflows/<task_id>/`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedStorageConfig {
    pub root: PathBuf,
}

impl Default for SharedStorageConfig {
    fn default() -> Self {
        SharedStorageConfig {
            root: PathBuf::from("/share"),
        }
    }
}

impl SafeDisplay for SharedStorageConfig {
    fn to_safe_string(&self) -> String {
        format!("root: {}\n", self.root.display())
    }
}

/// Core behavior switches shared by the gateway and the workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// When true, produced path fields are uploaded to the object store and
    /// `*_minio_url` fields are attached to stage outputs.
    pub auto_upload_to_minio: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            auto_upload_to_minio: true,
        }
    }
}

impl SafeDisplay for CoreConfig {
    fn to_safe_string(&self) -> String {
        format!("auto upload to minio: {}\n", self.auto_upload_to_minio)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuLockConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,
    /// Cumulative wait budget for one acquisition; zero means a single
    /// attempt.
    #[serde(with = "humantime_serde")]
    pub max_wait_time: Duration,
    /// TTL of the lock key; the last line of defense against leaked locks.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    pub exponential_backoff: f64,
}

impl Default for GpuLockConfig {
    fn default() -> Self {
        GpuLockConfig {
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(10),
            max_wait_time: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(3600),
            exponential_backoff: 2.0,
        }
    }
}

impl SafeDisplay for GpuLockConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "poll interval: {:?}", self.poll_interval);
        let _ = writeln!(&mut result, "max poll interval: {:?}", self.max_poll_interval);
        let _ = writeln!(&mut result, "max wait time: {:?}", self.max_wait_time);
        let _ = writeln!(&mut result, "lock timeout: {:?}", self.lock_timeout);
        let _ = writeln!(&mut result, "exponential backoff: {}", self.exponential_backoff);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutLevelsConfig {
    #[serde(with = "humantime_serde")]
    pub warning: Duration,
    #[serde(with = "humantime_serde")]
    pub soft_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub hard_timeout: Duration,
}

impl Default for TimeoutLevelsConfig {
    fn default() -> Self {
        TimeoutLevelsConfig {
            warning: Duration::from_secs(300),
            soft_timeout: Duration::from_secs(600),
            hard_timeout: Duration::from_secs(1800),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub max_retry: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            max_retry: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuLockMonitorConfig {
    pub enabled: bool,
    pub auto_recovery: bool,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    pub timeout_levels: TimeoutLevelsConfig,
    pub heartbeat: HeartbeatConfig,
    pub cleanup: CleanupConfig,
}

impl Default for GpuLockMonitorConfig {
    fn default() -> Self {
        GpuLockMonitorConfig {
            enabled: true,
            auto_recovery: true,
            monitor_interval: Duration::from_secs(30),
            timeout_levels: TimeoutLevelsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl SafeDisplay for GpuLockMonitorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "enabled: {}", self.enabled);
        let _ = writeln!(&mut result, "auto recovery: {}", self.auto_recovery);
        let _ = writeln!(&mut result, "monitor interval: {:?}", self.monitor_interval);
        let _ = writeln!(
            &mut result,
            "timeout levels: warning {:?}, soft {:?}, hard {:?}",
            self.timeout_levels.warning,
            self.timeout_levels.soft_timeout,
            self.timeout_levels.hard_timeout
        );
        let _ = writeln!(
            &mut result,
            "heartbeat: interval {:?}, timeout {:?}",
            self.heartbeat.interval, self.heartbeat.timeout
        );
        let _ = writeln!(
            &mut result,
            "cleanup: max retry {}, retry delay {:?}",
            self.cleanup.max_retry, self.cleanup.retry_delay
        );
        result
    }
}

/// Webhook delivery tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub retries: RetryConfig,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        CallbackConfig {
            request_timeout: Duration::from_secs(10),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for CallbackConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "request timeout: {:?}", self.request_timeout);
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct TestConfig {
        redis: RedisConfig,
        core: CoreConfig,
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("test.toml");
        std::fs::write(
            &config_path,
            r#"
            [redis]
            host = "redis.internal"

            [core]
            auto_upload_to_minio = false
            "#,
        )
        .unwrap();

        let loader: ConfigLoader<TestConfig> = ConfigLoader::new(&config_path);
        let config = loader.load().expect("config loads");

        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6379);
        assert!(!config.core.auto_upload_to_minio);
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retries = RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(retries.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retries.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retries.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(retries.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn redis_url_includes_auth_only_when_present() {
        let mut config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/0");
        config.password = Some("secret".to_string());
        assert_eq!(config.url(), "redis://:secret@localhost:6379/0");
        assert!(!config.to_safe_string().contains("secret"));
    }
}
