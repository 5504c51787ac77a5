/// 规则接口 (每个考试服务实现一次)
///
/// 处理器把每帧结果交给 `ExamRules::evaluate`, 规则只通过 `FlagUpdates`
/// 描述本帧要锁存的考试标志、要重算的复位标志与状态标志以及计数,
/// 真正写入由处理器完成.
use std::collections::BTreeSet;

use crate::detection::{InferenceResult, ModelSlot};
use crate::processor::state::FlagVec;

/// 步骤表: 模型槽位 → [(标志下标, 步骤名)]
#[derive(Debug, Clone, Default)]
pub struct StepTable {
    slots: Vec<Vec<(usize, String)>>,
}

impl StepTable {
    pub fn new(models: usize) -> Self {
        Self {
            slots: vec![Vec::new(); models],
        }
    }

    /// 追加一个槽位的若干 (flag, step) 映射
    pub fn steps<S: Into<String>>(
        mut self,
        slot: usize,
        entries: impl IntoIterator<Item = (usize, S)>,
    ) -> Self {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, Vec::new());
        }
        self.slots[slot].extend(entries.into_iter().map(|(f, s)| (f, s.into())));
        self
    }

    pub fn for_slot(&self, slot: ModelSlot) -> &[(usize, String)] {
        self.slots
            .get(slot.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 去重后的步骤总数
    pub fn total_steps(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|(_, s)| s.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}

/// 打分策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScorePolicy {
    #[default]
    Untracked,
    /// 截图时按已完成步骤占比给分, 满分 100
    Completeness,
}

impl ScorePolicy {
    pub fn score(self, completed: usize, total: usize) -> Option<u32> {
        match self {
            ScorePolicy::Untracked => None,
            ScorePolicy::Completeness if total == 0 => Some(0),
            ScorePolicy::Completeness => {
                Some(((completed.min(total) as f64 * 100.0) / total as f64).round() as u32)
            }
        }
    }
}

/// 计数项: 名称与上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub name: &'static str,
    pub cap: u32,
}

impl Tally {
    pub const fn new(name: &'static str, cap: u32) -> Self {
        Self { name, cap }
    }
}

/// 单帧的标志变更
pub struct FlagUpdates<'a> {
    exam: &'a FlagVec,
    status: Option<&'a FlagVec>,
    exam_len: usize,
    reset_len: usize,
    tally_len: usize,
    latched: Vec<usize>,
    resets: Vec<(usize, bool)>,
    statuses: Vec<(usize, bool)>,
    tallies: Vec<(usize, u32)>,
}

impl<'a> FlagUpdates<'a> {
    pub fn new(exam: &'a FlagVec, reset_len: usize) -> Self {
        Self {
            exam,
            status: None,
            exam_len: exam.len(),
            reset_len,
            tally_len: 0,
            latched: Vec::new(),
            resets: Vec::new(),
            statuses: Vec::new(),
            tallies: Vec::new(),
        }
    }

    /// 附带当前状态标志, 规则可读取其他槽位写入的状态
    pub fn with_status(mut self, status: &'a FlagVec) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tallies(mut self, len: usize) -> Self {
        self.tally_len = len;
        self
    }

    /// 已锁存 (含本帧) 的考试标志
    pub fn exam(&self, index: usize) -> bool {
        self.latched.contains(&index) || self.exam.get(index)
    }

    pub fn latch(&mut self, index: usize) {
        debug_assert!(index < self.exam_len, "exam flag {index} out of range");
        if index < self.exam_len && !self.latched.contains(&index) {
            self.latched.push(index);
        }
    }

    pub fn latch_all(&mut self, indices: impl IntoIterator<Item = usize>) {
        for i in indices {
            self.latch(i);
        }
    }

    /// 复位标志按本帧结果重算, 同一帧内后写覆盖先写
    pub fn set_reset(&mut self, index: usize, out_of_position: bool) {
        debug_assert!(index < self.reset_len, "reset flag {index} out of range");
        if index < self.reset_len {
            self.resets.retain(|(i, _)| *i != index);
            self.resets.push((index, out_of_position));
        }
    }

    /// 状态标志 (含本帧写入)
    pub fn status(&self, index: usize) -> bool {
        match self.statuses.iter().rev().find(|(i, _)| *i == index) {
            Some(&(_, v)) => v,
            None => self.status.is_some_and(|s| s.get(index)),
        }
    }

    /// 电平触发的状态, 不截图也不参与复位检查
    pub fn set_status(&mut self, index: usize, value: bool) {
        let len = self.status.map_or(0, FlagVec::len);
        debug_assert!(index < len, "status flag {index} out of range");
        if index < len {
            self.statuses.retain(|(i, _)| *i != index);
            self.statuses.push((index, value));
        }
    }

    /// 上报本帧计数, 处理器按上限取历史最大值
    pub fn tally(&mut self, index: usize, count: u32) {
        debug_assert!(index < self.tally_len, "tally {index} out of range");
        if index < self.tally_len {
            self.tallies.retain(|(i, _)| *i != index);
            self.tallies.push((index, count));
        }
    }

    pub fn latched(&self) -> &[usize] {
        &self.latched
    }

    pub fn resets(&self) -> &[(usize, bool)] {
        &self.resets
    }

    pub fn statuses(&self) -> &[(usize, bool)] {
        &self.statuses
    }

    pub fn tallies(&self) -> &[(usize, u32)] {
        &self.tallies
    }
}

/// 考试服务规则
pub trait ExamRules: Send + Sync {
    fn name(&self) -> &'static str;

    fn model_count(&self) -> usize;

    fn exam_flag_count(&self) -> usize;

    fn reset_flag_count(&self) -> usize {
        0
    }

    fn exam_steps(&self) -> &StepTable;

    fn reset_steps(&self) -> &StepTable;

    fn score_policy(&self) -> ScorePolicy {
        ScorePolicy::Untracked
    }

    /// 结束考试时是否同时清空复位状态
    fn reset_on_exam_stop(&self) -> bool {
        false
    }

    /// 电平状态数量 (如人员到位、警戒区存在)
    fn status_flag_count(&self) -> usize {
        0
    }

    /// 计数项, 下标即 `FlagUpdates::tally` 的下标
    fn tally_items(&self) -> &[Tally] {
        &[]
    }

    /// 按需抓拍: 收到请求后在该槽位的下一帧截图一次
    fn snapshot(&self) -> Option<(ModelSlot, &'static str)> {
        None
    }

    /// 按槽位分派, 检查本帧结果并写入 `flags`; 空结果应直接返回
    fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>);
}
