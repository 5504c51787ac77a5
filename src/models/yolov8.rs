// YOLOv8 ONNX 模型实现
// 包含: 模型加载、预处理、推理、后处理 (detect / segment / pose / classify)

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use fast_image_resize as fr;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{s, Array, Array4, Axis, IxDyn};
use ort::{CUDAExecutionProvider, GraphOptimizationLevel, Session};
use regex::Regex;
use tracing::{debug, info};

use super::{non_max_suppression, ModelLoader, Predictor};
use crate::config::ModelConfig;
use crate::detection::{Bbox, Embedding, InferenceResult, ModelSlot, ModelTask, Point2};

const CXYWH_OFFSET: usize = 4;
const KPT_STEP: usize = 3;
const DEFAULT_SIZE: u32 = 640;
const DEFAULT_KCONF: f32 = 0.55;
/// letterbox 填充色
const PAD_VALUE: f32 = 144.0 / 255.0;

/// YOLOv8 单模型推理器
pub struct YOLOv8 {
    session: Session,
    task: ModelTask,
    height: u32,
    width: u32,
    nk: usize,
    conf: f32,
    kconf: f32,
    iou: f32,
    classes: Option<Vec<usize>>,
    names: Arc<Vec<String>>,
    resizer: fr::Resizer,
}

/// 解析 `{0: 'person', 1: 'bicycle'}` 形式的类别表
fn parse_names(raw: &str) -> Vec<String> {
    match Regex::new(r"'([^']*)'|\x22([^\x22]*)\x22") {
        Ok(re) => re
            .captures_iter(raw)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// 解析 `[17, 3]` 形式的关键点形状, 取关键点个数
fn parse_kpt_count(raw: &str) -> Option<usize> {
    raw.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .next()
        .and_then(|n| n.trim().parse().ok())
}

impl YOLOv8 {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let mut builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if let Some(device_id) = config.device {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])?;
        }
        let session = builder
            .commit_from_file(&config.weights)
            .with_context(|| format!("failed to load {}", config.weights.display()))?;

        // input: [batch, 3, height, width], 动态维度为 -1
        let dims = session
            .inputs
            .first()
            .and_then(|i| i.input_type.tensor_dimensions())
            .cloned()
            .ok_or_else(|| anyhow!("model has no tensor input"))?;
        let dim = |i: usize| {
            dims.get(i)
                .copied()
                .filter(|&d| d > 0)
                .map_or(DEFAULT_SIZE, |d| d as u32)
        };
        let (height, width) = (dim(2), dim(3));

        let (names, nk) = {
            let metadata = session.metadata()?;
            let names = metadata
                .custom("names")?
                .map(|raw| parse_names(&raw))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| vec!["Unknown".to_string()]);
            let nk = match config.task {
                ModelTask::Pose => metadata
                    .custom("kpt_shape")?
                    .as_deref()
                    .and_then(parse_kpt_count)
                    .unwrap_or(17),
                _ => 0,
            };
            (names, nk)
        };

        Ok(Self {
            session,
            task: config.task,
            height,
            width,
            nk,
            conf: config.conf,
            kconf: DEFAULT_KCONF,
            iou: config.iou,
            classes: config.classes.clone(),
            names: Arc::new(names),
            resizer: fr::Resizer::new(),
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
        let r = (w1 / w0).min(h1 / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// 缩放 + 左上对齐填充 → NCHW
    pub fn preprocess(&mut self, x: &RgbImage) -> Result<Array<f32, IxDyn>> {
        let (w0, h0) = x.dimensions();
        let (w_new, h_new) = match self.task {
            ModelTask::Classify => (self.width, self.height),
            _ => {
                let (_, w, h) =
                    self.scale_wh(w0 as f32, h0 as f32, self.width as f32, self.height as f32);
                ((w as u32).max(1), (h as u32).max(1))
            }
        };

        let src = fr::images::Image::from_vec_u8(w0, h0, x.as_raw().clone(), fr::PixelType::U8x3)?;
        let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        self.resizer.resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;

        let mut ys = Array4::from_elem(
            (1, 3, self.height as usize, self.width as usize),
            PAD_VALUE,
        );
        for (i, rgb) in dst.buffer().chunks_exact(3).enumerate() {
            let (y, x) = (i / w_new as usize, i % w_new as usize);
            ys[[0, 0, y, x]] = rgb[0] as f32 / 255.0;
            ys[[0, 1, y, x]] = rgb[1] as f32 / 255.0;
            ys[[0, 2, y, x]] = rgb[2] as f32 / 255.0;
        }
        Ok(ys.into_dyn())
    }

    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let outputs = self.session.run(ort::inputs![xs.view()]?)?;
        self.session
            .outputs
            .iter()
            .map(|o| {
                Ok(outputs[o.name.as_str()]
                    .try_extract_tensor::<f32>()?
                    .into_owned())
            })
            .collect()
    }

    pub fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        width_original: f32,
        height_original: f32,
    ) -> Result<InferenceResult> {
        let preds = xs.first().ok_or_else(|| anyhow!("model produced no output"))?;
        let result = InferenceResult::new(self.names.clone());

        if let ModelTask::Classify = self.task {
            let probs = preds.index_axis(Axis(0), 0).iter().copied().collect();
            return Ok(result.with_probs(Embedding::new(probs)));
        }

        let protos = xs.get(1);
        let nm = match (self.task, protos) {
            (ModelTask::Segment, Some(p)) => p.shape().get(1).copied().unwrap_or(0),
            _ => 0,
        };
        let nc = preds.shape().get(1).map_or(0, |&n| {
            n.saturating_sub(CXYWH_OFFSET + nm + KPT_STEP * self.nk)
        });
        if nc == 0 {
            return Err(anyhow!("unexpected output shape {:?}", preds.shape()));
        }
        let ratio =
            (self.width as f32 / width_original).min(self.height as f32 / height_original);

        let anchor = preds.index_axis(Axis(0), 0);
        let mut data: Vec<(Bbox, Option<Vec<Point2>>, Option<Vec<f32>>)> = Vec::new();
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

            let Some((id, &confidence)) = clss
                .into_iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < self.conf {
                continue;
            }
            if let Some(classes) = &self.classes {
                if !classes.contains(&id) {
                    continue;
                }
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x = cx - w / 2.;
            let y = cy - h / 2.;
            let y_bbox = Bbox::new(
                x.max(0.0f32).min(width_original),
                y.max(0.0f32).min(height_original),
                w,
                h,
                id,
                confidence,
            );

            let y_kpts = match self.task {
                ModelTask::Pose => {
                    let kpts = pred.slice(s![pred.len() - KPT_STEP * self.nk..]);
                    let mut kpts_ = Vec::with_capacity(self.nk);
                    for i in 0..self.nk {
                        let kx = kpts[KPT_STEP * i] / ratio;
                        let ky = kpts[KPT_STEP * i + 1] / ratio;
                        let kconf = kpts[KPT_STEP * i + 2];
                        if kconf < self.kconf {
                            kpts_.push(Point2::default());
                        } else {
                            kpts_.push(Point2::new_with_conf(
                                kx.max(0.0f32).min(width_original),
                                ky.max(0.0f32).min(height_original),
                                kconf,
                            ));
                        }
                    }
                    Some(kpts_)
                }
                _ => None,
            };
            let coefs = (nm > 0).then(|| pred.slice(s![pred.len() - nm..]).to_vec());

            data.push((y_bbox, y_kpts, coefs));
        }

        non_max_suppression(&mut data, self.iou);

        let mut y_bboxes = Vec::with_capacity(data.len());
        let mut y_kpts = Vec::new();
        let mut y_masks = Vec::new();
        for (bbox, kpts, coefs) in data {
            if let Some(kpts) = kpts {
                y_kpts.push(kpts);
            }
            if let (Some(coefs), Some(protos)) = (coefs, protos) {
                let outline =
                    self.mask_outline(&coefs, protos, &bbox, width_original, height_original)?;
                y_masks.push(outline);
            }
            y_bboxes.push(bbox);
        }

        Ok(result
            .with_bboxes(y_bboxes)
            .with_keypoints(y_kpts)
            .with_masks(y_masks))
    }

    /// 掩码系数 × 原型 → 原图尺寸二值掩码 → 最大外轮廓
    fn mask_outline(
        &self,
        coefs: &[f32],
        protos: &Array<f32, IxDyn>,
        bbox: &Bbox,
        width_original: f32,
        height_original: f32,
    ) -> Result<Vec<(f32, f32)>> {
        let proto = protos.slice(s![0, .., .., ..]);
        let (nm, nh, nw) = proto.dim();

        let coefs = Array::from_shape_vec((1, nm), coefs.to_vec())?;
        let proto = proto.to_owned();
        let proto = proto.to_shape((nm, nh * nw))?;
        let mask = coefs.dot(&proto);

        // logit > 0 即 sigmoid > 0.5
        let logits = mask.as_slice().ok_or_else(|| anyhow!("mask is not contiguous"))?;
        let mask_im = GrayImage::from_fn(nw as u32, nh as u32, |x, y| {
            Luma([if logits[y as usize * nw + x as usize] > 0.0 { 255 } else { 0 }])
        });

        let (_, w_mask, h_mask) =
            self.scale_wh(width_original, height_original, nw as f32, nh as f32);
        let cropped = imageops::crop_imm(&mask_im, 0, 0, w_mask as u32, h_mask as u32).to_image();
        let mut full = imageops::resize(
            &cropped,
            width_original as u32,
            height_original as u32,
            FilterType::Triangle,
        );
        for (x, y, p) in full.enumerate_pixels_mut() {
            let inside = (x as f32) >= bbox.xmin()
                && (x as f32) <= bbox.xmax()
                && (y as f32) >= bbox.ymin()
                && (y as f32) <= bbox.ymax();
            p.0[0] = if inside && p.0[0] > 127 { 255 } else { 0 };
        }

        let outline = find_contours::<i32>(&full)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .max_by_key(|c| c.points.len())
            .map(|c| c.points.iter().map(|p| (p.x as f32, p.y as f32)).collect())
            .unwrap_or_default();
        Ok(outline)
    }

    pub fn task(&self) -> ModelTask {
        self.task
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }
}

impl Predictor for YOLOv8 {
    fn predict(&mut self, image: &RgbImage) -> Result<InferenceResult> {
        let t_pre = Instant::now();
        let xs = self.preprocess(image)?;
        let pre = t_pre.elapsed();

        let t_run = Instant::now();
        let ys = self.run(xs)?;
        let run = t_run.elapsed();

        let t_post = Instant::now();
        let (w0, h0) = image.dimensions();
        let result = self.postprocess(ys, w0 as f32, h0 as f32)?;
        debug!(?pre, ?run, post = ?t_post.elapsed(), "yolov8 timings");
        Ok(result)
    }
}

/// 按槽位配置加载 ONNX 权重
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
    fn load(&self, slot: ModelSlot, config: &ModelConfig) -> Result<Box<dyn Predictor>> {
        let model = YOLOv8::new(config)?;
        info!(
            %slot,
            task = ?model.task(),
            input = %format!("{}x{}", model.width(), model.height()),
            classes = model.names().len(),
            conf = model.conf(),
            "📦 ONNX 模型已加载"
        );
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ultralytics_metadata() {
        assert_eq!(
            parse_names("{0: 'oil_tank', 1: 'sweep'}"),
            vec!["oil_tank".to_string(), "sweep".to_string()]
        );
        assert_eq!(parse_kpt_count("[17, 3]"), Some(17));
        assert_eq!(parse_kpt_count("oops"), None);
    }
}
