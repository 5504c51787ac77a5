use std::fmt;
use std::sync::Arc;

use image::RgbImage;
use serde::Deserialize;

use crate::utils::Rect;
/// 检测系统数据结构定义
/// Data structures shared by streams, inference workers and processors

// ========== 枚举类型 ==========

/// 模型任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    #[default]
    Detect,
    Segment,
    Pose,
    Classify,
}

/// 模型槽位: 配置中模型列表的下标, 每个槽位独占一个队列和一个推理线程
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelSlot(pub usize);

impl ModelSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

// ========== 数据结构 ==========

/// 已解码帧 (拉流线程 → 推理线程)
#[derive(Clone)]
pub struct Frame {
    pub camera: usize,
    /// 本路流内的抓帧序号, 从 1 开始
    pub seq: u64,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(camera: usize, seq: u64, image: RgbImage) -> Self {
        Self {
            camera,
            seq,
            image: Arc::new(image),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.camera)
            .field("seq", &self.seq)
            .field("size", &self.image.dimensions())
            .finish()
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Default)]
pub struct Point2 {
    // A point2d with x, y, conf
    x: f32,
    y: f32,
    confidence: f32,
}

impl Point2 {
    pub fn new_with_conf(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// 低置信度关键点以 (0, 0) 占位
    pub fn is_visible(&self) -> bool {
        self.confidence > 0.0 || self.x > 0.0 || self.y > 0.0
    }

    pub fn to_pixel(&self) -> (i32, i32) {
        (self.x as i32, self.y as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, id: usize, confidence: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1, id, confidence)
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// 像素矩形 (坐标截断取整)
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.xmin as i32,
            self.ymin as i32,
            self.xmax() as i32,
            self.ymax() as i32,
        )
    }

    pub fn center(&self) -> (i32, i32) {
        self.rect().center()
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

/// 分类概率向量
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Embedding {
    data: Vec<f32>,
}

impl Embedding {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn topk(&self, k: usize) -> Vec<(usize, f32)> {
        let mut probs = self.data.iter().copied().enumerate().collect::<Vec<_>>();
        probs.sort_by(|a, b| b.1.total_cmp(&a.1));
        probs.truncate(k);
        probs
    }

    pub fn top1(&self) -> Option<(usize, f32)> {
        self.topk(1).first().copied()
    }
}

/// 单帧推理结果
///
/// 空的检测列表一律折叠为 `None`, 规则层只需判断一次
#[derive(Clone, Default)]
pub struct InferenceResult {
    names: Arc<Vec<String>>,
    pub probs: Option<Embedding>,
    pub bboxes: Option<Vec<Bbox>>,
    pub keypoints: Option<Vec<Vec<Point2>>>,
    /// 分割掩码轮廓 (像素坐标多边形), 与 bboxes 一一对应
    pub masks: Option<Vec<Vec<(f32, f32)>>>,
}

impl fmt::Debug for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceResult")
            .field(
                "Probs(top5)",
                &format_args!("{:?}", self.probs().map(|probs| probs.topk(5))),
            )
            .field("Bboxes", &self.bboxes)
            .field("Keypoints", &self.keypoints.as_ref().map(|k| k.len()))
            .field("Masks", &self.masks.as_ref().map(|m| m.len()))
            .finish()
    }
}

fn non_empty<T>(v: Option<Vec<T>>) -> Option<Vec<T>> {
    v.filter(|v| !v.is_empty())
}

impl InferenceResult {
    pub fn new(names: Arc<Vec<String>>) -> Self {
        Self {
            names,
            ..Default::default()
        }
    }

    pub fn with_bboxes(mut self, bboxes: Vec<Bbox>) -> Self {
        self.bboxes = non_empty(Some(bboxes));
        self
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Vec<Point2>>) -> Self {
        self.keypoints = non_empty(Some(keypoints));
        self
    }

    pub fn with_masks(mut self, masks: Vec<Vec<(f32, f32)>>) -> Self {
        self.masks = non_empty(Some(masks));
        self
    }

    pub fn with_probs(mut self, probs: Embedding) -> Self {
        self.probs = if probs.data().is_empty() {
            None
        } else {
            Some(probs)
        };
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn probs(&self) -> Option<&Embedding> {
        self.probs.as_ref()
    }

    pub fn bboxes(&self) -> Option<&[Bbox]> {
        self.bboxes.as_deref()
    }

    pub fn keypoints(&self) -> Option<&[Vec<Point2>]> {
        self.keypoints.as_deref()
    }

    pub fn masks(&self) -> Option<&[Vec<(f32, f32)>]> {
        self.masks.as_deref()
    }

    /// (类别名, 检测框) 迭代器
    pub fn detections(&self) -> impl Iterator<Item = (&str, &Bbox)> {
        self.bboxes()
            .unwrap_or_default()
            .iter()
            .map(|b| (self.name(b.id()).unwrap_or("unknown"), b))
    }

    /// 指定类别的全部检测框
    pub fn boxes_of<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Bbox> + 'a {
        self.detections()
            .filter(move |(name, _)| *name == class)
            .map(|(_, b)| b)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.boxes_of(class).next().is_some()
    }

    /// 分类模型的 top1 标签
    pub fn top1_label(&self) -> Option<&str> {
        self.probs()
            .and_then(Embedding::top1)
            .and_then(|(id, _)| self.name(id))
    }

    /// (类别名, 掩码轮廓) 迭代器
    pub fn segments(&self) -> impl Iterator<Item = (&str, &[(f32, f32)])> {
        let masks = self.masks().unwrap_or_default();
        self.bboxes()
            .unwrap_or_default()
            .iter()
            .zip(masks.iter())
            .map(|(b, m)| (self.name(b.id()).unwrap_or("unknown"), m.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_none()
            && self.bboxes.is_none()
            && self.keypoints.is_none()
            && self.masks.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Arc<Vec<String>> {
        Arc::new(vec!["oil_tank".into(), "sweep".into()])
    }

    #[test]
    fn empty_vectors_collapse_to_none() {
        let r = InferenceResult::new(names())
            .with_bboxes(vec![])
            .with_keypoints(vec![])
            .with_probs(Embedding::new(vec![]));
        assert!(r.bboxes().is_none());
        assert!(r.keypoints().is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn boxes_are_grouped_by_name() {
        let r = InferenceResult::new(names()).with_bboxes(vec![
            Bbox::from_xyxy(0., 0., 10., 10., 0, 0.9),
            Bbox::from_xyxy(5., 5., 20., 20., 1, 0.8),
            Bbox::from_xyxy(50., 50., 60., 60., 0, 0.7),
        ]);
        assert_eq!(r.boxes_of("oil_tank").count(), 2);
        assert!(r.has_class("sweep"));
        assert!(!r.has_class("hammer"));
    }

    #[test]
    fn bbox_center_truncates() {
        let b = Bbox::from_xyxy(10.7, 20.2, 31.9, 41.0, 0, 0.5);
        assert_eq!(b.rect(), Rect::new(10, 20, 31, 41));
        assert_eq!(b.center(), (20, 30));
    }

    #[test]
    fn classification_top1() {
        let r = InferenceResult::new(Arc::new(vec!["idle".into(), "welding".into()]))
            .with_probs(Embedding::new(vec![0.1, 0.9]));
        assert_eq!(r.top1_label(), Some("welding"));
    }
}
