/// 会话共享状态
///
/// - FlagVec:   定长原子布尔数组, 推理线程并发读写
/// - TallyVec:  定长原子计数 (穿戴物品数量)
/// - Ledger:    截图表、完成顺序、分数, 由一把粗粒度锁保护
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub struct FlagVec {
    flags: Box<[AtomicBool]>,
}

impl FlagVec {
    pub fn new(len: usize) -> Self {
        Self {
            flags: (0..len).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// 越界视为 false
    pub fn get(&self, index: usize) -> bool {
        self.flags
            .get(index)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// 返回旧值
    pub fn set(&self, index: usize, value: bool) -> bool {
        match self.flags.get(index) {
            Some(f) => f.swap(value, Ordering::AcqRel),
            None => {
                debug_assert!(false, "flag index {index} out of range ({})", self.len());
                false
            }
        }
    }

    pub fn fill(&self, value: bool) {
        for f in self.flags.iter() {
            f.store(value, Ordering::Release);
        }
    }

    pub fn any(&self) -> bool {
        self.flags.iter().any(|f| f.load(Ordering::Acquire))
    }

    pub fn count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.load(Ordering::Acquire))
            .count()
    }

    pub fn snapshot(&self) -> Vec<bool> {
        self.flags.iter().map(|f| f.load(Ordering::Acquire)).collect()
    }
}

/// 计数数组, 只增不减 (取历史最大值)
pub struct TallyVec {
    counts: Box<[AtomicU32]>,
}

impl TallyVec {
    pub fn new(len: usize) -> Self {
        Self {
            counts: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, index: usize) -> u32 {
        self.counts
            .get(index)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// 抬高到 `value`, 已更大则不变
    pub fn raise(&self, index: usize, value: u32) {
        if let Some(c) = self.counts.get(index) {
            c.fetch_max(value, Ordering::AcqRel);
        }
    }

    pub fn clear(&self) {
        for c in self.counts.iter() {
            c.store(0, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.counts.iter().map(|c| c.load(Ordering::Acquire)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StepKind {
    Exam,
    Reset,
    /// 按需抓拍 (每会话一张)
    Snapshot,
}

/// 已预留、尚未落盘的截图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub kind: StepKind,
    pub step: String,
    epoch: u64,
}

/// 截图账本
///
/// 截图分两步: 锁内 `reserve` 占位, 锁外编码写盘, 再回到锁内 `complete`.
/// 会话被清空后 epoch 改变, 迟到的 `complete` 会被丢弃.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    pub exam_images: BTreeMap<String, String>,
    pub exam_order: Vec<String>,
    pub exam_scores: BTreeMap<String, u32>,
    pub reset_images: BTreeMap<String, String>,
    pub snapshots: BTreeMap<String, String>,
    in_flight: BTreeSet<(StepKind, String)>,
    exam_epoch: u64,
    reset_epoch: u64,
}

impl Ledger {
    fn epoch(&self, kind: StepKind) -> u64 {
        match kind {
            StepKind::Exam | StepKind::Snapshot => self.exam_epoch,
            StepKind::Reset => self.reset_epoch,
        }
    }

    fn images(&self, kind: StepKind) -> &BTreeMap<String, String> {
        match kind {
            StepKind::Exam => &self.exam_images,
            StepKind::Reset => &self.reset_images,
            StepKind::Snapshot => &self.snapshots,
        }
    }

    /// 步骤未完成且无人在截图时占位
    pub fn reserve(&mut self, kind: StepKind, step: &str) -> Option<Reservation> {
        if self.images(kind).contains_key(step) {
            return None;
        }
        if !self.in_flight.insert((kind, step.to_string())) {
            return None;
        }
        Some(Reservation {
            kind,
            step: step.to_string(),
            epoch: self.epoch(kind),
        })
    }

    /// 写入截图 URL; `score` 参数为含本步在内的已完成考试步骤数.
    /// 会话已被清空时返回 None
    pub fn complete(
        &mut self,
        res: &Reservation,
        url: String,
        score: impl FnOnce(usize) -> Option<u32>,
    ) -> Option<Option<u32>> {
        if res.epoch != self.epoch(res.kind) {
            return None;
        }
        self.in_flight.remove(&(res.kind, res.step.clone()));
        let step = res.step.clone();
        match res.kind {
            StepKind::Exam => {
                self.exam_images.insert(step.clone(), url);
                self.exam_order.push(step.clone());
                let score = score(self.exam_order.len());
                if let Some(score) = score {
                    self.exam_scores.insert(step, score);
                }
                Some(score)
            }
            StepKind::Reset => {
                self.reset_images.insert(step, url);
                Some(None)
            }
            StepKind::Snapshot => {
                self.snapshots.insert(step, url);
                Some(None)
            }
        }
    }

    /// 截图失败, 撤销占位以便下一帧重试
    pub fn release(&mut self, res: &Reservation) {
        if res.epoch == self.epoch(res.kind) {
            self.in_flight.remove(&(res.kind, res.step.clone()));
        }
    }

    pub fn is_recorded(&self, kind: StepKind, step: &str) -> bool {
        self.images(kind).contains_key(step)
    }

    pub fn clear_exam(&mut self) {
        self.exam_images.clear();
        self.exam_order.clear();
        self.exam_scores.clear();
        self.snapshots.clear();
        self.in_flight.retain(|(k, _)| *k == StepKind::Reset);
        self.exam_epoch += 1;
    }

    pub fn clear_reset(&mut self) {
        self.reset_images.clear();
        self.in_flight.retain(|(k, _)| *k != StepKind::Reset);
        self.reset_epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_swap_and_fill() {
        let flags = FlagVec::new(3);
        assert!(!flags.any());
        assert!(!flags.set(1, true));
        assert!(flags.set(1, true));
        assert_eq!(flags.snapshot(), vec![false, true, false]);
        assert_eq!(flags.count(), 1);
        assert!(!flags.get(7));
        flags.fill(false);
        assert!(!flags.any());
    }

    #[test]
    fn ledger_records_each_step_once() {
        let mut ledger = Ledger::default();
        let res = ledger.reserve(StepKind::Exam, "basket_step_1").unwrap();
        // 截图进行中, 其他线程无法重复占位
        assert!(ledger.reserve(StepKind::Exam, "basket_step_1").is_none());
        assert_eq!(ledger.complete(&res, "/a.jpg".into(), |_| None), Some(None));
        assert!(ledger.reserve(StepKind::Exam, "basket_step_1").is_none());
        assert_eq!(ledger.exam_order, vec!["basket_step_1".to_string()]);
        assert_eq!(ledger.exam_images["basket_step_1"], "/a.jpg");
        ledger.clear_exam();
        assert!(ledger.exam_order.is_empty());
    }

    #[test]
    fn late_capture_after_clear_is_discarded() {
        let mut ledger = Ledger::default();
        let stale = ledger.reserve(StepKind::Exam, "welding_exam_1").unwrap();
        ledger.clear_exam();

        let fresh = ledger.reserve(StepKind::Exam, "welding_exam_1").unwrap();
        assert_eq!(ledger.complete(&stale, "/old.jpg".into(), |n| Some(n as u32)), None);
        assert!(ledger.exam_order.is_empty());

        assert_eq!(
            ledger.complete(&fresh, "/new.jpg".into(), |n| Some(n as u32)),
            Some(Some(1))
        );
        assert_eq!(ledger.exam_images["welding_exam_1"], "/new.jpg");
        assert_eq!(ledger.exam_scores["welding_exam_1"], 1);
    }

    #[test]
    fn released_step_can_be_retried() {
        let mut ledger = Ledger::default();
        let res = ledger.reserve(StepKind::Reset, "reset_step_2").unwrap();
        ledger.release(&res);
        assert!(ledger.reserve(StepKind::Reset, "reset_step_2").is_some());
        // 清空考试不影响复位占位
        ledger.clear_exam();
        assert!(ledger.reserve(StepKind::Reset, "reset_step_2").is_none());
    }

    #[test]
    fn tallies_keep_maximum() {
        let t = TallyVec::new(2);
        t.raise(0, 2);
        t.raise(0, 1);
        t.raise(5, 9);
        assert_eq!(t.snapshot(), vec![2, 0]);
        t.clear();
        assert_eq!(t.get(0), 0);
    }
}
