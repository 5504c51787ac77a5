#![allow(clippy::type_complexity)]
//! 实训考核视觉监测服务
//!
//! 多路 RTSP 摄像头 → 按模型槽位分发 → 多模型并行推理 → 考核规则判定 → 步骤截图
pub mod config; // 服务配置
pub mod detection; // 检测结果数据结构
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod manager; // 检测管理器
pub mod models; // 模型接口与实现
pub mod pipeline; // 拉流/推理线程与帧总线
pub mod processor; // 结果处理与截图
pub mod report; // 控制层应答
pub mod services; // 各考核服务规则
pub mod utils; // 几何与时间工具

pub use crate::config::{ModelConfig, RuntimeConfig, ServerConfig, StreamConfig};
pub use crate::detection::{Bbox, Embedding, Frame, InferenceResult, ModelSlot, ModelTask, Point2};
pub use crate::error::{Error, Result};
pub use crate::input::{CaptureBackend, VideoCapture};
pub use crate::manager::{DetectionManager, StartStatus, StopStatus};
pub use crate::models::{non_max_suppression, ModelLoader, Predictor};
pub use crate::processor::{ExamRules, ResultProcessor};
pub use crate::services::ServiceKind;
