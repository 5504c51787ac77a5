/// 服务配置 (Service Configuration)
///
/// 启动时从 TOML 文件加载一次, 之后只读
/// - StreamConfig:  每路摄像头的拉流参数
/// - ModelConfig:   每个模型槽位的权重与推理参数
/// - RuntimeConfig: 启停超时与重连退避
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::detection::ModelTask;
use crate::services::ServiceKind;
use crate::{Error, Result};

pub const DEFAULT_QUEUE_SIZE: usize = 100;
pub const DEFAULT_FRAME_SKIP: u32 = 5;
pub const DEFAULT_CONF: f32 = 0.6;

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_frame_skip() -> u32 {
    DEFAULT_FRAME_SKIP
}

fn default_conf() -> f32 {
    DEFAULT_CONF
}

fn default_iou() -> f32 {
    0.45
}

/// 单路摄像头配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub rtsp_url: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// 每 N 帧解码一帧
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    /// 接收本路画面的模型槽位 (有序)
    #[serde(default)]
    pub target_models: BTreeSet<usize>,
}

impl StreamConfig {
    pub fn new(rtsp_url: impl Into<String>, target_models: impl IntoIterator<Item = usize>) -> Self {
        Self {
            rtsp_url: rtsp_url.into(),
            queue_size: DEFAULT_QUEUE_SIZE,
            frame_skip: DEFAULT_FRAME_SKIP,
            target_models: target_models.into_iter().collect(),
        }
    }

    pub fn with_frame_skip(mut self, frame_skip: u32) -> Self {
        self.frame_skip = frame_skip;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub weights: PathBuf,
    #[serde(default)]
    pub task: ModelTask,
    #[serde(default = "default_conf")]
    pub conf: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    /// 只保留这些类别 (分割/穿戴模型)
    #[serde(default)]
    pub classes: Option<Vec<usize>>,
    /// CUDA 设备号, 缺省走 CPU
    #[serde(default)]
    pub device: Option<i32>,
}

impl ModelConfig {
    pub fn new(weights: impl Into<PathBuf>, task: ModelTask) -> Self {
        Self {
            weights: weights.into(),
            task,
            conf: DEFAULT_CONF,
            iou: default_iou(),
            classes: None,
            device: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub start_timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub read_timeout_ms: u64,
    /// 抓拍请求的最长等待
    pub snapshot_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 30,
            stop_grace_ms: 1000,
            kill_grace_ms: 2000,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 60_000,
            read_timeout_ms: 5000,
            snapshot_wait_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.snapshot_wait_ms)
    }
}

/// 服务总配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceKind,
    pub images_dir: PathBuf,
    pub img_url_path: String,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// 区域坐标覆盖, 缺省使用编译期常量
    #[serde(default)]
    pub regions: Option<toml::Table>,
}

impl ServerConfig {
    pub fn new(service: ServiceKind, images_dir: impl Into<PathBuf>, img_url_path: &str) -> Self {
        Self {
            service,
            images_dir: images_dir.into(),
            img_url_path: img_url_path.to_string(),
            models: Vec::new(),
            streams: Vec::new(),
            runtime: RuntimeConfig::default(),
            regions: None,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// 所有流共享的队列容量
    pub fn queue_size(&self) -> usize {
        self.streams
            .iter()
            .map(|s| s.queue_size)
            .max()
            .unwrap_or(DEFAULT_QUEUE_SIZE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::Config("at least one model is required".into()));
        }
        let expected = self.service.model_count();
        if self.models.len() != expected {
            return Err(Error::Config(format!(
                "service {} expects {} models, got {}",
                self.service,
                expected,
                self.models.len()
            )));
        }
        for (i, model) in self.models.iter().enumerate() {
            if !(0.0..=1.0).contains(&model.conf) {
                return Err(Error::Config(format!(
                    "models[{i}].conf must be within [0, 1], got {}",
                    model.conf
                )));
            }
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.frame_skip == 0 {
                return Err(Error::Config(format!("streams[{i}].frame_skip must be >= 1")));
            }
            if stream.queue_size == 0 {
                return Err(Error::Config(format!("streams[{i}].queue_size must be >= 1")));
            }
            if let Some(bad) = stream.target_models.iter().find(|&&m| m >= self.models.len()) {
                return Err(Error::Config(format!(
                    "streams[{i}] targets model {bad}, only {} configured",
                    self.models.len()
                )));
            }
        }
        if self.runtime.reconnect_initial_ms == 0
            || self.runtime.reconnect_max_ms < self.runtime.reconnect_initial_ms
        {
            return Err(Error::Config(
                "reconnect_max_ms must be >= reconnect_initial_ms > 0".into(),
            ));
        }
        Ok(())
    }
}
