/// 检测结果 (Detection Results)
///
/// 推理线程产出, 规则处理器消费
/// - InferenceResult: 检测框 / 关键点 / 掩码 / 分类概率
/// - ModelSlot:       模型槽位标识
/// - Frame:           拉流线程解码后的画面
pub mod types;

pub use types::{Bbox, Embedding, Frame, InferenceResult, ModelSlot, ModelTask, Point2};
