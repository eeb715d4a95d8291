use mediaflow_common::config::{
    CallbackConfig, ConfigLoader, CoreConfig, GpuLockConfig, HeartbeatConfig, RedisConfig,
    SharedStorageConfig,
};
use mediaflow_common::tracing::TracingConfig;
use mediaflow_common::SafeDisplay;
use mediaflow_service_base::config::BlobStorageConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub redis: RedisConfig,
    pub blob_storage: BlobStorageConfig,
    pub shared_storage: SharedStorageConfig,
    pub core: CoreConfig,
    pub gpu_lock: GpuLockConfig,
    pub heartbeat: HeartbeatConfig,
    pub callback: CallbackConfig,
    pub consumer: ConsumerConfig,
    pub tools: ToolsConfig,
    /// Global per-parameter defaults consulted by the input resolver when a
    /// request and the earlier stages provide no value.
    pub node_defaults: HashMap<String, Value>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut node_defaults = HashMap::new();
        node_defaults.insert("keyframe_sample_count".to_string(), Value::from(100));
        WorkerConfig {
            tracing: TracingConfig::local_dev("mediaflow-worker"),
            environment: "dev".to_string(),
            redis: RedisConfig::default(),
            blob_storage: BlobStorageConfig::default(),
            shared_storage: SharedStorageConfig::default(),
            core: CoreConfig::default(),
            gpu_lock: GpuLockConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            callback: CallbackConfig::default(),
            consumer: ConsumerConfig::default(),
            tools: ToolsConfig::default(),
            node_defaults,
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
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
        let _ = writeln!(
            &mut result,
            "heartbeat: interval {:?}, timeout {:?}",
            self.heartbeat.interval, self.heartbeat.timeout
        );
        let _ = writeln!(&mut result, "callback:");
        let _ = writeln!(&mut result, "{}", self.callback.to_safe_string_indented());
        let _ = writeln!(&mut result, "consumer:");
        let _ = writeln!(&mut result, "{}", self.consumer.to_safe_string_indented());
        let _ = writeln!(&mut result, "tools:");
        let _ = writeln!(&mut result, "{}", self.tools.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Node names this worker consumes; empty means the whole catalog.
    pub enabled_nodes: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    pub max_concurrent_executions: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            enabled_nodes: Vec::new(),
            poll_timeout: Duration::from_secs(5),
            max_concurrent_executions: 2,
        }
    }
}

impl SafeDisplay for ConsumerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "enabled nodes: {}",
            if self.enabled_nodes.is_empty() {
                "all".to_string()
            } else {
                self.enabled_nodes.join(", ")
            }
        );
        let _ = writeln!(&mut result, "poll timeout: {:?}", self.poll_timeout);
        let _ = writeln!(
            &mut result,
            "max concurrent executions: {}",
            self.max_concurrent_executions
        );
        result
    }
}

/// External tool invocation settings. The core treats each tool as an opaque
/// command; model hyperparameters live in the tools' own configs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub ffmpeg: FfmpegToolConfig,
    pub whisper: WhisperToolConfig,
    pub audio_separator: ToolConfig,
    pub pyannote: PyannoteToolConfig,
    pub paddleocr: ToolConfig,
    pub indextts: ToolConfig,
    pub wservice: WserviceConfig,
}

impl SafeDisplay for ToolsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "ffmpeg: {}", self.ffmpeg.command);
        let _ = writeln!(
            &mut result,
            "whisper: {} (device {})",
            self.whisper.tool.command, self.whisper.device
        );
        let _ = writeln!(&mut result, "audio separator: {}", self.audio_separator.command);
        let _ = writeln!(&mut result, "pyannote: {}", self.pyannote.tool.command);
        let _ = writeln!(&mut result, "paddleocr: {}", self.paddleocr.command);
        let _ = writeln!(&mut result, "indextts: {}", self.indextts.command);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolConfig {
    pub command: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            command: "true".to_string(),
            timeout: Duration::from_secs(1800),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FfmpegToolConfig {
    pub command: String,
    pub probe_command: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FfmpegToolConfig {
    fn default() -> Self {
        FfmpegToolConfig {
            command: "ffmpeg".to_string(),
            probe_command: "ffprobe".to_string(),
            timeout: Duration::from_secs(1800),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhisperToolConfig {
    #[serde(flatten)]
    pub tool: ToolConfig,
    /// `cuda` serializes through the GPU lock, `cpu` does not.
    pub device: String,
}

impl Default for WhisperToolConfig {
    fn default() -> Self {
        WhisperToolConfig {
            tool: ToolConfig::default(),
            device: "cuda".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PyannoteToolConfig {
    #[serde(flatten)]
    pub tool: ToolConfig,
    /// Remote diarization endpoint used when a task opts into the paid API.
    pub api_endpoint: Option<String>,
}

impl Default for PyannoteToolConfig {
    fn default() -> Self {
        PyannoteToolConfig {
            tool: ToolConfig::default(),
            api_endpoint: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WserviceConfig {
    /// LLM endpoint consulted by the subtitle optimizer.
    pub optimize_endpoint: Option<String>,
    #[serde(with = "humantime_serde")]
    pub optimize_timeout: Duration,
}

impl Default for WserviceConfig {
    fn default() -> Self {
        WserviceConfig {
            optimize_endpoint: None,
            optimize_timeout: Duration::from_secs(120),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/mediaflow-worker.toml"))
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
