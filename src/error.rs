/// 错误类型
/// Error types shared by the pipeline, processor and manager
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// 摄像头不可达或流已关闭
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("inference failed on slot {slot}: {reason}")]
    Inference { slot: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// 启动屏障未在超时内触发
    #[error("{worker} did not report ready within {secs}s")]
    StartTimeout { worker: String, secs: u64 },

    /// 启动过程中收到停止请求
    #[error("startup cancelled by stop request")]
    StartCancelled,

    #[error("failed to spawn worker {name}: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn connection(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
