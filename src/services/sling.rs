/// 吊索具作业考核规则
///
/// - m0 人体姿态 (悬挂点): 手腕进入悬挂区域
/// - m1 警戒区检测 (侧视)
/// - m2 人体姿态 (检查台): 手腕依次触及六件吊索具
/// - m3 俯视检测: 刷子、警戒区、安全带与自锁器
///
/// 两个视角的警戒区存在与否作为电平触发的状态标志保存, 该服务没有复位检查.
use serde::Deserialize;

use crate::detection::{InferenceResult, ModelSlot, Point2};
use crate::processor::{ExamRules, FlagUpdates, StepTable};
use crate::utils::geometry::{boxes_intersect, Rect};

pub const MODEL_COUNT: usize = 4;
pub const EXAM_FLAGS: usize = 12;
/// 状态标志: 0 侧视警戒区, 1 俯视警戒区
pub const STATUS_FLAGS: usize = 2;

const SUSPENSION_POSE: usize = 0;
const WARNING_ZONE: usize = 1;
const INSPECTION_POSE: usize = 2;
const TOP_VIEW: usize = 3;

const LEFT_WRIST: usize = 9;
const RIGHT_WRIST: usize = 10;

/// 第一件检查物品对应的考试标志
const FIRST_INSPECTION: usize = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlingRegions {
    pub suspension_regions: Vec<Rect>,
    /// 检查台上六件吊索具的位置, 按检查顺序排列
    pub inspection_regions: Vec<Rect>,
}

impl Default for SlingRegions {
    fn default() -> Self {
        Self {
            suspension_regions: vec![
                Rect::new(0, 0, 400, 400),
                Rect::new(0, 680, 400, 1080),
                Rect::new(1520, 0, 1920, 400),
                Rect::new(1520, 680, 1920, 1080),
            ],
            inspection_regions: vec![
                Rect::new(160, 620, 425, 880),
                Rect::new(426, 620, 691, 880),
                Rect::new(692, 620, 957, 880),
                Rect::new(958, 620, 1223, 880),
                Rect::new(1224, 620, 1489, 880),
                Rect::new(1490, 620, 1755, 880),
            ],
        }
    }
}

pub struct SlingRules {
    regions: SlingRegions,
    exam: StepTable,
    reset: StepTable,
}

fn wrists(person: &[Point2]) -> impl Iterator<Item = (i32, i32)> + '_ {
    [LEFT_WRIST, RIGHT_WRIST]
        .into_iter()
        .filter_map(move |i| person.get(i))
        .filter(|p| p.is_visible())
        .map(Point2::to_pixel)
}

impl SlingRules {
    pub fn new(regions: SlingRegions) -> Self {
        let step = |f: usize| (f, format!("sling_step_{}", f + 1));
        let inspection_steps = (0..regions.inspection_regions.len())
            .map(|i| step(FIRST_INSPECTION + i))
            .filter(|(f, _)| *f < 8);
        let exam = StepTable::new(MODEL_COUNT)
            .steps(SUSPENSION_POSE, [step(1)])
            .steps(INSPECTION_POSE, inspection_steps)
            .steps(TOP_VIEW, [0, 11, 9, 10, 8].map(step));
        Self {
            regions,
            exam,
            reset: StepTable::new(MODEL_COUNT),
        }
    }

    fn suspension(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let reached = result.keypoints().unwrap_or_default().iter().any(|person| {
            wrists(person).any(|w| self.regions.suspension_regions.iter().any(|r| r.contains(w)))
        });
        if reached {
            flags.latch(1);
        }
    }

    fn warning_zone(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>, view: usize) {
        let present = result.has_class("warning_zone");
        if present {
            flags.latch(0);
        }
        flags.set_status(view, present);
    }

    fn inspection(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        for person in result.keypoints().unwrap_or_default() {
            for w in wrists(person) {
                for (i, region) in self.regions.inspection_regions.iter().enumerate() {
                    let flag = FIRST_INSPECTION + i;
                    if flag < 8 && region.contains(w) {
                        flags.latch(flag);
                    }
                }
            }
        }
    }

    fn top_view(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        if result.has_class("brush") {
            flags.latch_all([9, 10, 11]);
        }
        self.warning_zone(result, flags, 1);
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

impl Default for SlingRules {
    fn default() -> Self {
        Self::new(SlingRegions::default())
    }
}

impl ExamRules for SlingRules {
    fn name(&self) -> &'static str {
        "sling"
    }

    fn model_count(&self) -> usize {
        MODEL_COUNT
    }

    fn exam_flag_count(&self) -> usize {
        EXAM_FLAGS
    }

    fn status_flag_count(&self) -> usize {
        STATUS_FLAGS
    }

    fn exam_steps(&self) -> &StepTable {
        &self.exam
    }

    fn reset_steps(&self) -> &StepTable {
        &self.reset
    }

    fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        match slot.index() {
            SUSPENSION_POSE if result.keypoints().is_some() => self.suspension(result, flags),
            WARNING_ZONE if result.bboxes().is_some() => self.warning_zone(result, flags, 0),
            INSPECTION_POSE if result.keypoints().is_some() => self.inspection(result, flags),
            TOP_VIEW if result.bboxes().is_some() => self.top_view(result, flags),
            _ => {}
        }
    }
}
