/// 区域几何工具
/// Region geometry: point/rect/polygon predicates and raster IoU
///
/// 所有坐标均为摄像头像素坐标 (整数), 边界包含在内.
/// IoU 按像素栅格计算 (imageproc 多边形填充), 负坐标被裁掉.
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point as DrawPoint;
use serde::Deserialize;

pub type Point = (i32, i32);

/// 轴对齐矩形 (x1, y1, x2, y2), 两端包含
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "[i32; 4]")]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl From<[i32; 4]> for Rect {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl Rect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 中心点, 向下取整
    pub fn center(&self) -> Point {
        ((self.x1 + self.x2).div_euclid(2), (self.y1 + self.y2).div_euclid(2))
    }

    pub fn contains(&self, p: Point) -> bool {
        point_in_rect(p, self)
    }
}

/// 多边形顶点序列 (首尾自动闭合)
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Polygon(pub Vec<Point>);

impl Polygon {
    pub fn new(points: &[Point]) -> Self {
        Self(points.to_vec())
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn contains(&self, p: Point) -> bool {
        point_in_polygon(p, &self.0)
    }
}

/// 矩形或多边形区域
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Region {
    Rect(Rect),
    Polygon(Polygon),
}

impl Region {
    pub fn contains(&self, p: Point) -> bool {
        match self {
            Region::Rect(r) => r.contains(p),
            Region::Polygon(poly) => poly.contains(p),
        }
    }
}

pub fn point_in_rect(p: Point, rect: &Rect) -> bool {
    let (x, y) = p;
    rect.x1 <= x && x <= rect.x2 && rect.y1 <= y && y <= rect.y2
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let (px, py) = (p.0 as i64, p.1 as i64);
    let (ax, ay) = (a.0 as i64, a.1 as i64);
    let (bx, by) = (b.0 as i64, b.1 as i64);
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    cross == 0
        && px >= ax.min(bx)
        && px <= ax.max(bx)
        && py >= ay.min(by)
        && py <= ay.max(by)
}

/// 点是否在多边形内 (含边界)
pub fn point_in_polygon(p: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n == 0 {
        return false;
    }
    for i in 0..n {
        if on_segment(p, polygon[i], polygon[(i + 1) % n]) {
            return true;
        }
    }
    if n < 3 {
        return false;
    }

    // even-odd 射线法
    let (px, py) = (p.0 as f64, p.1 as f64);
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i].0 as f64, polygon[i].1 as f64);
        let (xj, yj) = (polygon[j].0 as f64, polygon[j].1 as f64);
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// 两矩形是否相交; 仅当一个严格位于另一个左侧或上方时为 false
pub fn boxes_intersect(a: &Rect, b: &Rect) -> bool {
    !(a.x2 < b.x1 || b.x2 < a.x1 || a.y2 < b.y1 || b.y2 < a.y1)
}

fn rect_area(rect: &Rect) -> i64 {
    let w = (rect.x2 - rect.x1.max(0) + 1).max(0) as i64;
    let h = (rect.y2 - rect.y1.max(0) + 1).max(0) as i64;
    w * h
}

/// 在覆盖多边形与矩形的最小画布上填充多边形, 再统计像素
fn raster_iou(polygon: &[Point], rect: &Rect) -> f32 {
    // imageproc 要求首尾不重复
    let polygon = match polygon {
        [first, .., last] if first == last => &polygon[..polygon.len() - 1],
        _ => polygon,
    };
    if polygon.is_empty() {
        return 0.0;
    }

    let xs = polygon.iter().map(|p| p.0).chain([rect.x1, rect.x2]);
    let ys = polygon.iter().map(|p| p.1).chain([rect.y1, rect.y2]);
    let (x0, x1) = (xs.clone().min().unwrap_or(0).max(0), xs.max().unwrap_or(-1));
    let (y0, y1) = (ys.clone().min().unwrap_or(0).max(0), ys.max().unwrap_or(-1));
    if x1 < x0 || y1 < y0 {
        return 0.0;
    }

    let mut canvas = GrayImage::new((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
    let shifted: Vec<DrawPoint<i32>> = polygon
        .iter()
        .map(|&(x, y)| DrawPoint::new(x - x0, y - y0))
        .collect();
    draw_polygon_mut(&mut canvas, &shifted, Luma([255u8]));

    let mut area = 0i64;
    let mut inter = 0i64;
    for (x, y, px) in canvas.enumerate_pixels() {
        if px.0[0] == 0 {
            continue;
        }
        area += 1;
        if point_in_rect((x as i32 + x0, y as i32 + y0), rect) {
            inter += 1;
        }
    }

    let union = area + rect_area(rect) - inter;
    if union <= 0 {
        return 0.0;
    }
    inter as f32 / union as f32
}

/// 分割掩码轮廓与矩形的 IoU
pub fn mask_rect_iou(mask: &[(f32, f32)], rect: &Rect) -> f32 {
    let polygon: Vec<Point> = mask.iter().map(|&(x, y)| (x as i32, y as i32)).collect();
    raster_iou(&polygon, rect)
}

/// 矩形与多边形的 IoU
pub fn rect_polygon_iou(rect: &Rect, polygon: &[Point]) -> f32 {
    raster_iou(polygon, rect)
}
