/// 视频输入系统 (Video Input System)
///
/// 拉流线程通过 CaptureBackend 打开设备, 逐帧 grab, 只对需要的帧 retrieve 解码
/// - Decoder:   RTSP主动拉流解码器 (ez-ffmpeg, 需要 `ffmpeg` 特性)
/// - Synthetic: 脚本化的合成画面, 用于测试与演示
use image::RgbImage;

use crate::Result;

#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use decoder::FfmpegBackend;
pub use synthetic::{SyntheticBackend, SyntheticSession, SyntheticStats};

/// 已打开的采集设备
pub trait VideoCapture: Send {
    /// 前进一帧但不解码
    fn grab(&mut self) -> Result<()>;

    /// 解码最近一次 grab 的帧
    fn retrieve(&mut self) -> Result<RgbImage>;
}

/// 采集后端, 负责按地址打开设备
pub trait CaptureBackend: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn VideoCapture>>;
}
