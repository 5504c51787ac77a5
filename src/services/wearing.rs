/// 焊接劳保穿戴检查
///
/// - m0 人体姿态: 画面内有人即视为考生到位 (电平)
/// - m1 穿戴检测: 考生到位时统计各类劳保用品, 取历史最大值并按件数封顶
///
/// 没有考试步骤与复位步骤; 结果通过计数和一次性抓拍对外提供.
use serde::Deserialize;

use crate::detection::{InferenceResult, ModelSlot};
use crate::processor::{ExamRules, FlagUpdates, StepTable, Tally};
use crate::utils::geometry::{boxes_intersect, Rect};

pub const MODEL_COUNT: usize = 2;

pub const POSE: usize = 0;
pub const ITEMS: usize = 1;

/// 状态标志: 考生是否在指定位置
pub const HUMAN_IN_POSITION: usize = 0;

pub const SNAPSHOT_STEP: &str = "welding_wearing";

/// 劳保用品及应穿戴件数
pub const WEARING_ITEMS: [Tally; 5] = [
    Tally::new("pants", 1),
    Tally::new("jacket", 1),
    Tally::new("helmet", 1),
    Tally::new("gloves", 2),
    Tally::new("shoes", 2),
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WearingRegions {
    /// 考生站位区域
    pub position_area: Rect,
    /// 参与计数的区域
    pub item_area: Rect,
}

impl Default for WearingRegions {
    fn default() -> Self {
        Self {
            position_area: Rect::new(0, 0, 1920, 1080),
            item_area: Rect::new(0, 0, 1920, 1080),
        }
    }
}

pub struct WearingRules {
    regions: WearingRegions,
    empty: StepTable,
}

impl WearingRules {
    pub fn new(regions: WearingRegions) -> Self {
        Self {
            regions,
            empty: StepTable::new(MODEL_COUNT),
        }
    }

    fn position(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let in_position = result
            .bboxes()
            .unwrap_or_default()
            .iter()
            .any(|b| boxes_intersect(&b.rect(), &self.regions.position_area));
        flags.set_status(HUMAN_IN_POSITION, in_position);
    }

    fn items(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        if !flags.status(HUMAN_IN_POSITION) {
            return;
        }
        for (i, item) in WEARING_ITEMS.iter().enumerate() {
            let n = result
                .boxes_of(item.name)
                .filter(|b| boxes_intersect(&b.rect(), &self.regions.item_area))
                .count();
            flags.tally(i, n as u32);
        }
    }
}

impl Default for WearingRules {
    fn default() -> Self {
        Self::new(WearingRegions::default())
    }
}

impl ExamRules for WearingRules {
    fn name(&self) -> &'static str {
        "wearing"
    }

    fn model_count(&self) -> usize {
        MODEL_COUNT
    }

    fn exam_flag_count(&self) -> usize {
        0
    }

    fn exam_steps(&self) -> &StepTable {
        &self.empty
    }

    fn reset_steps(&self) -> &StepTable {
        &self.empty
    }

    fn status_flag_count(&self) -> usize {
        1
    }

    fn tally_items(&self) -> &[Tally] {
        &WEARING_ITEMS
    }

    fn snapshot(&self) -> Option<(ModelSlot, &'static str)> {
        Some((ModelSlot(ITEMS), SNAPSHOT_STEP))
    }

    fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        match slot.index() {
            // 无人时同样要清除到位状态
            POSE => self.position(result, flags),
            ITEMS if result.bboxes().is_some() => self.items(result, flags),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Bbox;
    use crate::processor::{FlagVec, ImageStore, ResultProcessor};
    use image::RgbImage;
    use std::sync::Arc;

    fn names() -> Arc<Vec<String>> {
        Arc::new(
            ["pants", "jacket", "helmet", "gloves", "shoes", "person"]
                .map(String::from)
                .to_vec(),
        )
    }

    fn boxes(ids: &[usize]) -> InferenceResult {
        InferenceResult::new(names()).with_bboxes(
            ids.iter()
                .enumerate()
                .map(|(i, &id)| {
                    let x = 100. + 50. * i as f32;
                    Bbox::from_xyxy(x, 100., x + 40., 200., id, 0.9)
                })
                .collect(),
        )
    }

    fn processor(dir: &std::path::Path) -> ResultProcessor {
        ResultProcessor::new(
            Box::new(WearingRules::default()),
            ImageStore::new(dir, "/static/images").unwrap(),
        )
    }

    #[test]
    fn items_ignored_until_person_in_position() {
        let rules = WearingRules::default();
        let exam = FlagVec::new(0);
        let status = FlagVec::new(1);
        let mut updates = FlagUpdates::new(&exam, 0)
            .with_status(&status)
            .with_tallies(WEARING_ITEMS.len());

        rules.evaluate(ModelSlot(ITEMS), &boxes(&[0, 1, 2]), &mut updates);
        assert!(updates.tallies().is_empty());

        rules.evaluate(ModelSlot(POSE), &boxes(&[5]), &mut updates);
        assert!(updates.status(HUMAN_IN_POSITION));
        rules.evaluate(ModelSlot(ITEMS), &boxes(&[3, 3, 3]), &mut updates);
        assert_eq!(
            updates.tallies(),
            &[(0, 0), (1, 0), (2, 0), (3, 3), (4, 0)]
        );
    }

    #[test]
    fn counts_keep_maximum_and_respect_caps() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);

        p.process_result(ModelSlot(POSE), &boxes(&[5]), &frame);
        assert_eq!(p.status_flags(), vec![true]);

        p.process_result(ModelSlot(ITEMS), &boxes(&[0, 0, 3, 3, 3, 4]), &frame);
        p.process_result(ModelSlot(ITEMS), &boxes(&[2]), &frame);
        assert_eq!(
            p.tallies(),
            vec![("pants", 1), ("jacket", 0), ("helmet", 1), ("gloves", 2), ("shoes", 1)]
        );

        // 考生离开后不再累计
        p.process_result(ModelSlot(POSE), &InferenceResult::default(), &frame);
        assert_eq!(p.status_flags(), vec![false]);
        p.process_result(ModelSlot(ITEMS), &boxes(&[1, 4, 4]), &frame);
        assert_eq!(p.tallies()[1], ("jacket", 0));
        assert_eq!(p.tallies()[4], ("shoes", 1));
    }

    #[test]
    fn snapshot_saved_once_from_item_camera() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);

        assert!(p.request_snapshot());
        p.process_result(ModelSlot(POSE), &boxes(&[5]), &frame);
        assert!(p.snapshot(SNAPSHOT_STEP).is_none());

        p.process_result(ModelSlot(ITEMS), &boxes(&[1]), &frame);
        p.process_result(ModelSlot(ITEMS), &boxes(&[1]), &frame);
        let url = p.snapshot(SNAPSHOT_STEP).unwrap();
        assert!(url.starts_with("/static/images/welding_wearing_"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(p.exam_order().is_empty());

        p.init_exam_variables();
        assert!(p.snapshot(SNAPSHOT_STEP).is_none());
        assert_eq!(p.status_flags(), vec![false]);
    }
}
