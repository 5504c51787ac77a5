/// 焊接作业考核规则
///
/// 模型槽位:
/// - m0 油桶 / 扫把检测
/// - m1 焊机与一次线、二次线分割
/// - m2 总闸、漏保指示灯检测
/// - m3 气瓶分割
/// - m4 焊台工具检测 (接地夹、刷子、铁锤)
/// - m5 焊接动作分类
/// - m6 焊机开关检测
/// - m7 焊枪 / 搭铁线归位检测
///
/// 考试标志 23 个 (welding_exam_1..23), 复位标志 6 个 (reset_step_1..6).
use serde::Deserialize;
use tracing::debug;

use crate::detection::{InferenceResult, ModelSlot};
use crate::processor::{ExamRules, FlagUpdates, ScorePolicy, StepTable};
use crate::utils::geometry::{boxes_intersect, mask_rect_iou, Polygon, Rect};

pub const MODEL_COUNT: usize = 8;
pub const EXAM_FLAGS: usize = 23;
pub const RESET_FLAGS: usize = 6;

// 模型槽位, 即配置中 models 的顺序
pub const OIL_TANK: usize = 0;
pub const MACHINE_LINES: usize = 1;
pub const SWITCH_LIGHTS: usize = 2;
pub const GAS_CYLINDER: usize = 3;
pub const DESK_TOOLS: usize = 4;
pub const WELDING_ACTION: usize = 5;
pub const MACHINE_SWITCH: usize = 6;
pub const GUN_HOME: usize = 7;

const LINE_IOU: f32 = 0.01;
const MACHINE_IOU: f32 = 0.1;

/// 考场区域 (像素坐标)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WeldingRegions {
    /// 油桶安全区
    pub safe_area: Polygon,
    pub first_line: Rect,
    pub welding_machine: Rect,
    pub gun_secondary_line: Rect,
    pub ground_secondary_line: Rect,
    pub gas_cylinder: Rect,
    /// 焊枪、搭铁线的默认存放位置
    pub gun_ground_home: Rect,
    /// 焊台 (接地夹、刷子、铁锤)
    pub grounding_wire: Rect,
}

impl Default for WeldingRegions {
    fn default() -> Self {
        Self {
            safe_area: Polygon::new(&[(1563, 0), (1520, 399), (2006, 554), (2159, 0)]),
            first_line: Rect::new(644, 879, 926, 1245),
            welding_machine: Rect::new(936, 880, 1546, 1279),
            gun_secondary_line: Rect::new(1578, 1028, 1866, 1116),
            ground_secondary_line: Rect::new(1574, 1196, 1841, 1264),
            gas_cylinder: Rect::new(644, 879, 926, 1245),
            gun_ground_home: Rect::new(649, 476, 1107, 918),
            grounding_wire: Rect::new(623, 252, 2026, 1379),
        }
    }
}

pub struct WeldingRules {
    regions: WeldingRegions,
    exam: StepTable,
    reset: StepTable,
}

fn exam_step(n: usize) -> String {
    format!("welding_exam_{n}")
}

fn reset_step(n: usize) -> String {
    format!("reset_step_{n}")
}

impl WeldingRules {
    pub fn new(regions: WeldingRegions) -> Self {
        let table = |flags: &[usize]| flags.iter().map(|&f| (f, exam_step(f + 1))).collect::<Vec<_>>();
        let exam = StepTable::new(MODEL_COUNT)
            .steps(OIL_TANK, table(&[0, 22]))
            .steps(MACHINE_LINES, table(&[1, 2, 3, 4]))
            .steps(GAS_CYLINDER, table(&[5, 10, 17]))
            .steps(SWITCH_LIGHTS, table(&[6, 7, 15, 16]))
            .steps(DESK_TOOLS, table(&[9, 18, 19]))
            .steps(WELDING_ACTION, table(&[11, 12, 13]))
            .steps(MACHINE_SWITCH, table(&[8, 14]))
            .steps(GUN_HOME, table(&[20, 21]));

        let reset = StepTable::new(MODEL_COUNT)
            .steps(OIL_TANK, [(0, reset_step(1))])
            .steps(SWITCH_LIGHTS, [(1, reset_step(2)), (2, reset_step(3))])
            .steps(MACHINE_SWITCH, [(3, reset_step(4))])
            .steps(GUN_HOME, [(4, reset_step(5)), (5, reset_step(6))]);

        Self { regions, exam, reset }
    }

    pub fn regions(&self) -> &WeldingRegions {
        &self.regions
    }

    fn oil_tank(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        for (name, bbox) in result.detections() {
            let in_safe_area = self.regions.safe_area.contains(bbox.center());
            match name {
                "oil_tank" if in_safe_area => {
                    flags.latch(0);
                    flags.set_reset(0, false);
                }
                "oil_tank" => flags.set_reset(0, true),
                // 焊接结束后在作业区清扫
                "sweep" if !in_safe_area && flags.exam(13) => flags.latch(22),
                _ => {}
            }
        }
    }

    fn machine_lines(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let r = &self.regions;
        for mask in result.masks().unwrap_or_default() {
            if mask_rect_iou(mask, &r.first_line) > LINE_IOU {
                flags.latch(1);
            }
            if mask_rect_iou(mask, &r.welding_machine) > MACHINE_IOU {
                // 焊机与焊机接地同时确认
                flags.latch_all([3, 4]);
            }
            if mask_rect_iou(mask, &r.gun_secondary_line) > LINE_IOU
                || mask_rect_iou(mask, &r.ground_secondary_line) > LINE_IOU
            {
                flags.latch(2);
            }
        }
    }

    fn switch_lights(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        for (name, _) in result.detections() {
            match name {
                "red_light_on" => {
                    flags.set_reset(1, true);
                    flags.latch(6);
                }
                "green_light_on" => {
                    flags.set_reset(2, true);
                    flags.latch(7);
                }
                "red_light_off" => {
                    flags.set_reset(1, false);
                    if flags.exam(6) {
                        flags.latch(16);
                    }
                }
                "green_light_off" => {
                    flags.set_reset(2, false);
                    if flags.exam(7) {
                        flags.latch(15);
                    }
                }
                _ => {}
            }
        }
    }

    fn gas_cylinder(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let present = result
            .masks()
            .unwrap_or_default()
            .iter()
            .any(|mask| mask_rect_iou(mask, &self.regions.gas_cylinder) > LINE_IOU);
        if !present {
            return;
        }
        flags.latch(5);
        // 漏保合闸后开阀, 焊接结束后关阀
        if flags.exam(7) {
            flags.latch(10);
        }
        if flags.exam(13) {
            flags.latch(17);
        }
    }

    fn desk_tools(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let desk = &self.regions.grounding_wire;
        let mut tool_seen = false;
        for (name, bbox) in result.detections() {
            match name {
                "grounding_wire" if boxes_intersect(&bbox.rect(), desk) => flags.latch(9),
                "brush" | "hammer" => {
                    tool_seen = true;
                    if flags.exam(13) && boxes_intersect(&bbox.rect(), desk) {
                        flags.latch(18);
                    }
                }
                _ => {}
            }
        }
        if !tool_seen && flags.exam(18) {
            flags.latch_all([19, 22]);
        }
    }

    fn welding_action(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        if result.top1_label() == Some("welding") {
            flags.latch_all([11, 12, 13]);
        }
    }

    fn machine_switch(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        for (name, _) in result.detections() {
            match name {
                "welding_switch_on" => {
                    flags.set_reset(3, true);
                    flags.latch(8);
                }
                "welding_switch_off" => {
                    flags.set_reset(3, false);
                    if flags.exam(8) {
                        flags.latch(14);
                    }
                }
                _ => {}
            }
        }
    }

    fn gun_home(&self, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let home = &self.regions.gun_ground_home;
        // 未在默认位置看到即视为未归位
        flags.set_reset(4, true);
        flags.set_reset(5, true);
        for (name, bbox) in result.detections() {
            if !boxes_intersect(&bbox.rect(), home) {
                continue;
            }
            match name {
                "welding_gun" => {
                    flags.set_reset(4, false);
                    if flags.exam(19) {
                        flags.latch(20);
                    }
                }
                "grounding_wire" => {
                    flags.set_reset(5, false);
                    if flags.exam(19) {
                        flags.latch(21);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for WeldingRules {
    fn default() -> Self {
        Self::new(WeldingRegions::default())
    }
}

impl ExamRules for WeldingRules {
    fn name(&self) -> &'static str {
        "welding"
    }

    fn model_count(&self) -> usize {
        MODEL_COUNT
    }

    fn exam_flag_count(&self) -> usize {
        EXAM_FLAGS
    }

    fn reset_flag_count(&self) -> usize {
        RESET_FLAGS
    }

    fn exam_steps(&self) -> &StepTable {
        &self.exam
    }

    fn reset_steps(&self) -> &StepTable {
        &self.reset
    }

    fn score_policy(&self) -> ScorePolicy {
        ScorePolicy::Completeness
    }

    fn reset_on_exam_stop(&self) -> bool {
        true
    }

    fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
        let payload = match slot.index() {
            MACHINE_LINES | GAS_CYLINDER => result.masks().is_some(),
            WELDING_ACTION => result.probs().is_some(),
            _ => result.bboxes().is_some(),
        };
        if !payload {
            debug!(%slot, "空结果, 跳过");
            return;
        }

        match slot.index() {
            OIL_TANK => self.oil_tank(result, flags),
            MACHINE_LINES => self.machine_lines(result, flags),
            SWITCH_LIGHTS => self.switch_lights(result, flags),
            GAS_CYLINDER => self.gas_cylinder(result, flags),
            DESK_TOOLS => self.desk_tools(result, flags),
            WELDING_ACTION => self.welding_action(result, flags),
            MACHINE_SWITCH => self.machine_switch(result, flags),
            GUN_HOME => self.gun_home(result, flags),
            _ => {}
        }
    }
}
