/// 工具模块
/// Utility modules
pub mod geometry;

pub use geometry::{
    boxes_intersect, mask_rect_iou, point_in_polygon, point_in_rect, rect_polygon_iou, Point,
    Polygon, Rect, Region,
};

/// 本地时间字符串, 用于截图文件名 (例: 20241019_153000)
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!("%Y%m%d{}%H%M%S", delimiter);
    chrono::Local::now().format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_string_shape() {
        let s = gen_time_string("_");
        assert_eq!(s.len(), 15);
        assert_eq!(&s[8..9], "_");
        assert!(s.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
    }
}
