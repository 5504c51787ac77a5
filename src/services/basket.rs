/// 吊篮作业考核规则
///
/// - m0 人体姿态: 手腕进入清洗工作区即完成清洗
/// - m1 提升机检测: 提升机空载试运行
/// - m2 俯视检测: 刷子、安全带与自锁器
use serde::Deserialize;

use crate::detection::{InferenceResult, ModelSlot};
use crate::processor::{ExamRules, FlagUpdates, StepTable};
use crate::utils::geometry::{boxes_intersect, Rect};

pub const MODEL_COUNT: usize = 3;
pub const EXAM_FLAGS: usize = 12;

const POSE: usize = 0;
const HOIST: usize = 1;
const TOP_VIEW: usize = 2;

const LEFT_WRIST: usize = 9;
const RIGHT_WRIST: usize = 10;

const CLEANING: [usize; 3] = [9, 10, 11];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BasketRegions {
    /// 清洗工作区 (四角)
    pub work_regions: Vec<Rect>,
    /// 整个画面; 提升机出现在画面任意位置即视为试运行
    pub frame: Rect,
    pub hoist_area: Rect,
}

impl Default for BasketRegions {
    fn default() -> Self {
        Self {
            work_regions: vec![
                Rect::new(0, 0, 400, 400),
                Rect::new(0, 680, 400, 1080),
                Rect::new(1520, 0, 1920, 400),
                Rect::new(1520, 680, 1920, 1080),
            ],
            frame: Rect::new(0, 0, 1920, 1080),
            hoist_area: Rect::new(233, 456, 565, 999),
        }
    }
}

pub struct BasketRules {
    regions: BasketRegions,
    exam: StepTable,
    reset: StepTable,
}

impl BasketRules {
    pub fn new(regions: BasketRegions) -> Self {
        let step = |f: usize| (f, format!("basket_step_{}", f + 1));
        let exam = StepTable::new(MODEL_COUNT)
            .steps(HOIST, (0..8).map(step))
            .steps(TOP_VIEW, [0, 8, 9, 10, 11].map(step));
        Self {
            regions,
            exam,
            reset: StepTable::new(MODEL_COUNT),
        }
    }

    fn pose(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        for person in result.keypoints().unwrap_or_default() {
            let wrists = [LEFT_WRIST, RIGHT_WRIST]
                .into_iter()
                .filter_map(|i| person.get(i))
                .filter(|p| p.is_visible());
            for wrist in wrists {
                if self
                    .regions
                    .work_regions
                    .iter()
                    .any(|r| r.contains(wrist.to_pixel()))
                {
                    flags.latch_all(CLEANING);
                    return;
                }
            }
        }
    }

    fn hoist(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let in_view = |r: &Rect| {
            boxes_intersect(r, &self.regions.frame) || boxes_intersect(r, &self.regions.hoist_area)
        };
        if result.boxes_of("hoist").any(|b| in_view(&b.rect())) {
            flags.latch_all(0..8);
        }
    }

    fn top_view(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        if result.has_class("brush") {
            flags.latch_all(CLEANING);
        }
        // 安全带挂在自锁器上
        let hooked = result.boxes_of("safety_belt").any(|belt| {
            result
                .boxes_of("self_locking")
                .any(|lock| boxes_intersect(&belt.rect(), &lock.rect()))
        });
        if hooked {
            flags.latch(8);
        }
    }
}

impl Default for BasketRules {
    fn default() -> Self {
        Self::new(BasketRegions::default())
    }
}

impl ExamRules for BasketRules {
    fn name(&self) -> &'static str {
        "basket"
    }

    fn model_count(&self) -> usize {
        MODEL_COUNT
    }

    fn exam_flag_count(&self) -> usize {
        EXAM_FLAGS
    }

    fn exam_steps(&self) -> &StepTable {
        &self.exam
    }

    fn reset_steps(&self) -> &StepTable {
        &self.reset
    }

    fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        match slot.index() {
            POSE if result.keypoints().is_some() => self.pose(result, flags),
            HOIST if result.bboxes().is_some() => self.hoist(result, flags),
            TOP_VIEW if result.bboxes().is_some() => self.top_view(result, flags),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Bbox, Point2};
    use crate::processor::{FlagVec, ImageStore, ResultProcessor};
    use image::RgbImage;
    use std::sync::Arc;

    fn names() -> Arc<Vec<String>> {
        Arc::new(
            ["hoist", "brush", "safety_belt", "self_locking"]
                .map(String::from)
                .to_vec(),
        )
    }

    fn person(wrist: (f32, f32)) -> Vec<Point2> {
        let mut kpts = vec![Point2::new_with_conf(960., 540., 0.9); 17];
        kpts[RIGHT_WRIST] = Point2::new_with_conf(wrist.0, wrist.1, 0.9);
        kpts
    }

    #[test]
    fn wrist_in_corner_completes_cleaning() {
        let rules = BasketRules::default();
        let exam = FlagVec::new(EXAM_FLAGS);

        let mut updates = FlagUpdates::new(&exam, 0);
        let centre = InferenceResult::new(names()).with_keypoints(vec![person((960., 540.))]);
        rules.evaluate(ModelSlot(POSE), &centre, &mut updates);
        assert!(updates.latched().is_empty());

        let corner = InferenceResult::new(names()).with_keypoints(vec![person((1800., 900.))]);
        rules.evaluate(ModelSlot(POSE), &corner, &mut updates);
        assert_eq!(updates.latched(), &CLEANING);
    }

    #[test]
    fn belt_must_touch_self_locking() {
        let rules = BasketRules::default();
        let exam = FlagVec::new(EXAM_FLAGS);
        let mut updates = FlagUpdates::new(&exam, 0);

        let apart = InferenceResult::new(names()).with_bboxes(vec![
            Bbox::from_xyxy(0., 0., 10., 10., 2, 0.9),
            Bbox::from_xyxy(50., 50., 60., 60., 3, 0.9),
        ]);
        rules.evaluate(ModelSlot(TOP_VIEW), &apart, &mut updates);
        assert!(updates.latched().is_empty());

        let hooked = InferenceResult::new(names()).with_bboxes(vec![
            Bbox::from_xyxy(0., 0., 10., 10., 2, 0.9),
            Bbox::from_xyxy(5., 5., 60., 60., 3, 0.9),
        ]);
        rules.evaluate(ModelSlot(TOP_VIEW), &hooked, &mut updates);
        assert_eq!(updates.latched(), &[8]);
    }

    #[test]
    fn hoist_trial_run_captures_eight_steps() {
        let dir = tempfile::tempdir().unwrap();
        let p = ResultProcessor::new(
            Box::new(BasketRules::default()),
            ImageStore::new(dir.path(), "/static/images").unwrap(),
        );
        p.set_exam_active(true);
        let frame = RgbImage::new(16, 16);
        let hoist = InferenceResult::new(names())
            .with_bboxes(vec![Bbox::from_xyxy(300., 500., 400., 600., 0, 0.8)]);

        p.process_result(ModelSlot(HOIST), &hoist, &frame);
        let order = p.exam_order();
        assert_eq!(order.len(), 8);
        assert_eq!(order[0], "basket_step_1");
        assert_eq!(order[7], "basket_step_8");
        assert!(p.exam_scores().is_empty());

        // 俯视模型只补截尚未完成的步骤
        let brush = InferenceResult::new(names())
            .with_bboxes(vec![Bbox::from_xyxy(10., 10., 20., 20., 1, 0.8)]);
        p.process_result(ModelSlot(TOP_VIEW), &brush, &frame);
        assert_eq!(
            &p.exam_order()[8..],
            &["basket_step_10", "basket_step_11", "basket_step_12"]
        );
    }

    #[test]
    fn hoist_anywhere_in_frame_counts() {
        let rules = BasketRules::default();
        let exam = FlagVec::new(EXAM_FLAGS);
        let mut updates = FlagUpdates::new(&exam, 0);

        // 远离 hoist_area, 但在画面内
        let hoist = InferenceResult::new(names())
            .with_bboxes(vec![Bbox::from_xyxy(1600., 100., 1800., 300., 0, 0.8)]);
        rules.evaluate(ModelSlot(HOIST), &hoist, &mut updates);
        assert_eq!(updates.latched(), &[0, 1, 2, 3, 4, 5, 6, 7]);

        let mut updates = FlagUpdates::new(&exam, 0);
        let outside = InferenceResult::new(names())
            .with_bboxes(vec![Bbox::from_xyxy(2000., 1200., 2100., 1300., 0, 0.8)]);
        rules.evaluate(ModelSlot(HOIST), &outside, &mut updates);
        assert!(updates.latched().is_empty());
    }
}
