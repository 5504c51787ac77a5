/// 流水线 (Pipeline)
///
/// 摄像头 → 拉流线程 → 每模型队列 → 推理线程 → 规则处理器
/// - bus:       有界队列, 满则丢最旧
/// - streamer:  拉流与重连
/// - inference: 模型加载与推理循环
/// - signal:    停止信号 / 启动屏障
/// - worker:    具名线程与三级关停
pub mod bus;
pub mod inference;
pub mod signal;
pub mod streamer;
pub mod worker;

pub use bus::{FrameBus, FrameQueue};
pub use inference::InferenceManager;
pub use signal::{BarrierOutcome, StopSignal};
pub use streamer::{Backoff, StreamManager, StreamState, StreamWorker};
pub use worker::{ShutdownOutcome, WorkerHandle};
