/// 步骤截图: 在画面上叠加检测结果并落盘
use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect as DrawRect;

use crate::detection::InferenceResult;
use crate::utils::gen_time_string;
use crate::Result;

pub const SKELETON: [(usize, usize); 16] = [
    (0, 1),
    (0, 2),
    (1, 3),
    (2, 4),
    (5, 6),
    (5, 11),
    (6, 12),
    (11, 12),
    (5, 7),
    (6, 8),
    (7, 9),
    (8, 10),
    (11, 13),
    (12, 14),
    (13, 15),
    (14, 16),
];

const BRIGHT_COLORS: [[u8; 3]; 12] = [
    [255, 0, 0],     // 红色
    [0, 255, 0],     // 绿色
    [0, 0, 255],     // 蓝色
    [255, 255, 0],   // 黄色
    [255, 0, 255],   // 品红
    [0, 255, 255],   // 青色
    [255, 128, 0],   // 橙色
    [255, 0, 128],   // 粉红
    [128, 255, 0],   // 黄绿
    [0, 128, 255],   // 天蓝
    [255, 255, 255], // 白色
    [128, 0, 255],   // 紫色
];

fn color(id: usize) -> Rgb<u8> {
    Rgb(BRIGHT_COLORS[id % BRIGHT_COLORS.len()])
}

/// 截图目录与对外 URL 前缀
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
    url_prefix: String,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存 `{step}_{时间}.jpg`, 返回对外 URL
    pub fn capture(&self, step: &str, frame: &RgbImage, result: &InferenceResult) -> Result<String> {
        let mut canvas = frame.clone();
        annotate(&mut canvas, result);

        let file_name = format!("{}_{}.jpg", step, gen_time_string("_"));
        canvas.save_with_format(self.dir.join(&file_name), ImageFormat::Jpeg)?;
        Ok(format!("{}/{}", self.url_prefix, file_name))
    }
}

/// 叠加检测框、关键点骨架、分割轮廓
pub fn annotate(img: &mut RgbImage, result: &InferenceResult) {
    let (w, h) = img.dimensions();

    for bbox in result.bboxes().unwrap_or_default() {
        let c = color(bbox.id());
        let x = bbox.xmin().max(0.) as i32;
        let y = bbox.ymin().max(0.) as i32;
        let bw = (bbox.width().max(1.) as u32).min(w.saturating_sub(x as u32)).max(1);
        let bh = (bbox.height().max(1.) as u32).min(h.saturating_sub(y as u32)).max(1);
        draw_hollow_rect_mut(img, DrawRect::at(x, y).of_size(bw, bh), c);
        if bw > 2 && bh > 2 {
            draw_hollow_rect_mut(img, DrawRect::at(x + 1, y + 1).of_size(bw - 2, bh - 2), c);
        }
    }

    for (i, (_, outline)) in result.segments().enumerate() {
        let c = color(i);
        let n = outline.len();
        for k in 0..n {
            draw_line_segment_mut(img, outline[k], outline[(k + 1) % n], c);
        }
    }

    for kpts in result.keypoints().unwrap_or_default() {
        for &(a, b) in SKELETON.iter() {
            match (kpts.get(a), kpts.get(b)) {
                (Some(p), Some(q)) if p.is_visible() && q.is_visible() => {
                    draw_line_segment_mut(img, (p.x(), p.y()), (q.x(), q.y()), Rgb([0, 255, 0]));
                }
                _ => {}
            }
        }
        for (i, p) in kpts.iter().enumerate() {
            if p.is_visible() {
                draw_filled_circle_mut(img, p.to_pixel(), 3, color(i));
            }
        }
    }
}
