use mediaflow_common::config::{
    CallbackConfig, ConfigLoader, CoreConfig, GpuLockConfig, GpuLockMonitorConfig, RedisConfig,
    SharedStorageConfig,
};
use mediaflow_common::tracing::TracingConfig;
use mediaflow_common::SafeDisplay;
use mediaflow_service_base::config::BlobStorageConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub redis: RedisConfig,
    pub blob_storage: BlobStorageConfig,
    pub shared_storage: SharedStorageConfig,
    pub core: CoreConfig,
    pub gpu_lock: GpuLockConfig,
    pub gpu_lock_monitor: GpuLockMonitorConfig,
    pub callback: CallbackConfig,
    pub cors_origin_regex: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("mediaflow-gateway"),
            environment: "dev".to_string(),
            http_port: 8080,
            redis: RedisConfig::default(),
            blob_storage: BlobStorageConfig::default(),
            shared_storage: SharedStorageConfig::default(),
            core: CoreConfig::default(),
            gpu_lock: GpuLockConfig::default(),
            gpu_lock_monitor: GpuLockMonitorConfig::default(),
            callback: CallbackConfig::default(),
            cors_origin_regex: "https://*.mediaflow.dev".to_string(),
        }
    }
}

impl SafeDisplay for GatewayConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(&mut result, "blob storage:");
        let _ = writeln!(&mut result, "{}", self.blob_storage.to_safe_string_indented());
        let _ = writeln!(&mut result, "shared storage:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.shared_storage.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "core:");
        let _ = writeln!(&mut result, "{}", self.core.to_safe_string_indented());
        let _ = writeln!(&mut result, "gpu lock:");
        let _ = writeln!(&mut result, "{}", self.gpu_lock.to_safe_string_indented());
        let _ = writeln!(&mut result, "gpu lock monitor:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.gpu_lock_monitor.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "callback:");
        let _ = writeln!(&mut result, "{}", self.callback.to_safe_string_indented());
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<GatewayConfig> {
    ConfigLoader::new(&PathBuf::from("config/mediaflow-gateway.toml"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::path::PathBuf;
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".."))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
