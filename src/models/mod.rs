/// 模型统一接口与实现
///
/// # 架构说明
///
/// 推理线程只依赖两个 trait:
/// - **ModelLoader**: 启动时按槽位配置加载一次权重, 在推理线程内调用
/// - **Predictor**:   单帧推理, 输出 `InferenceResult`
///
/// ## 具体实现
/// - **YOLOv8** (`onnx` 特性): ONNX Runtime 后端, 支持 detect/segment/pose/classify
///   - 预处理 (letterbox 左上对齐)
///   - 推理 (ort Session)
///   - 后处理 (NMS、关键点、掩码轮廓)
///   - 文件: `yolov8.rs`
///
/// ## 核心流程
/// ```text
/// RgbImage → Predictor::predict → InferenceResult → ResultProcessor
/// ```
use anyhow::Result;
use image::RgbImage;

use crate::config::ModelConfig;
use crate::detection::{Bbox, InferenceResult, ModelSlot, Point2};

#[cfg(feature = "onnx")]
pub mod yolov8;

#[cfg(feature = "onnx")]
pub use yolov8::{OnnxLoader, YOLOv8};

/// 单帧推理接口
pub trait Predictor {
    fn predict(&mut self, image: &RgbImage) -> Result<InferenceResult>;
}

/// 模型加载器, 由管理器共享给所有推理线程
pub trait ModelLoader: Send + Sync {
    fn load(&self, slot: ModelSlot, config: &ModelConfig) -> Result<Box<dyn Predictor>>;
}

impl<F> Predictor for F
where
    F: FnMut(&RgbImage) -> Result<InferenceResult>,
{
    fn predict(&mut self, image: &RgbImage) -> Result<InferenceResult> {
        self(image)
    }
}

pub fn non_max_suppression(
    xs: &mut Vec<(Bbox, Option<Vec<Point2>>, Option<Vec<f32>>)>,
    iou_threshold: f32,
) {
    xs.sort_by(|b1, b2| b2.0.confidence().total_cmp(&b1.0.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].0.iou(&xs[index].0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
