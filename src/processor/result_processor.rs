/// 结果处理器 (per-service state machine)
///
/// 推理线程并发调用 `process_result`. 标志与计数为原子写; 截图时先在账本锁内
/// 占位, 锁外编码写盘, 再回到锁内记录 URL, 保证每个步骤每个会话最多截图一次.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbImage;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::capture::ImageStore;
use super::rules::{ExamRules, FlagUpdates};
use super::state::{FlagVec, Ledger, Reservation, StepKind, TallyVec};
use crate::detection::{InferenceResult, ModelSlot};

pub struct ResultProcessor {
    rules: Box<dyn ExamRules>,
    exam_flags: FlagVec,
    reset_flags: FlagVec,
    status_flags: FlagVec,
    tallies: TallyVec,
    exam_active: AtomicBool,
    snapshot_requested: AtomicBool,
    ledger: Mutex<Ledger>,
    store: ImageStore,
}

impl ResultProcessor {
    pub fn new(rules: Box<dyn ExamRules>, store: ImageStore) -> Self {
        Self {
            exam_flags: FlagVec::new(rules.exam_flag_count()),
            reset_flags: FlagVec::new(rules.reset_flag_count()),
            status_flags: FlagVec::new(rules.status_flag_count()),
            tallies: TallyVec::new(rules.tally_items().len()),
            exam_active: AtomicBool::new(false),
            snapshot_requested: AtomicBool::new(false),
            ledger: Mutex::new(Ledger::default()),
            store,
            rules,
        }
    }

    pub fn rules(&self) -> &dyn ExamRules {
        self.rules.as_ref()
    }

    /// 处理一帧推理结果
    pub fn process_result(&self, slot: ModelSlot, result: &InferenceResult, frame: &RgbImage) {
        if slot.index() >= self.rules.model_count() {
            debug_assert!(
                false,
                "model slot {slot} out of range for service {} ({} models)",
                self.rules.name(),
                self.rules.model_count()
            );
            error!(%slot, service = self.rules.name(), "❌ 未知模型槽位, 忽略该结果");
            return;
        }

        let mut updates = FlagUpdates::new(&self.exam_flags, self.reset_flags.len())
            .with_status(&self.status_flags)
            .with_tallies(self.tallies.len());
        self.rules.evaluate(slot, result, &mut updates);

        for &i in updates.latched() {
            self.exam_flags.set(i, true);
        }
        for &(i, value) in updates.resets() {
            self.reset_flags.set(i, value);
        }
        for &(i, value) in updates.statuses() {
            self.status_flags.set(i, value);
        }
        let items = self.rules.tally_items();
        for &(i, count) in updates.tallies() {
            if let Some(item) = items.get(i) {
                self.tallies.raise(i, count.min(item.cap));
            }
        }

        self.save_step(slot, result, frame);
    }

    /// 锁内挑出需要截图的步骤并占位
    fn reserve_steps(&self, slot: ModelSlot) -> Vec<Reservation> {
        let mut ledger = self.ledger.lock();
        let mut reserved = Vec::new();

        let (kind, table, flags) = if self.exam_active() {
            (StepKind::Exam, self.rules.exam_steps(), &self.exam_flags)
        } else {
            (StepKind::Reset, self.rules.reset_steps(), &self.reset_flags)
        };
        for (flag, step) in table.for_slot(slot) {
            if flags.get(*flag) {
                reserved.extend(ledger.reserve(kind, step));
            }
        }

        if let Some((snap_slot, step)) = self.rules.snapshot() {
            if snap_slot == slot && self.snapshot_requested.load(Ordering::Acquire) {
                reserved.extend(ledger.reserve(StepKind::Snapshot, step));
            }
        }
        reserved
    }

    fn save_step(&self, slot: ModelSlot, result: &InferenceResult, frame: &RgbImage) {
        let reserved = self.reserve_steps(slot);
        if reserved.is_empty() {
            return;
        }

        let total = self.rules.exam_steps().total_steps();
        let policy = self.rules.score_policy();
        for res in reserved {
            let captured = self.store.capture(&res.step, frame, result);
            let mut ledger = self.ledger.lock();
            let url = match captured {
                Ok(url) => url,
                Err(e) => {
                    ledger.release(&res);
                    error!(%slot, step = %res.step, "❌ 截图保存失败: {e}");
                    continue;
                }
            };
            match ledger.complete(&res, url, |done| policy.score(done, total)) {
                None => warn!(%slot, step = %res.step, "⚠️ 会话已重置, 丢弃迟到的截图"),
                Some(score) => match res.kind {
                    StepKind::Exam => info!(%slot, step = %res.step, ?score, "📸 考试步骤完成"),
                    StepKind::Reset => info!(%slot, step = %res.step, "📸 复位步骤未归位"),
                    StepKind::Snapshot => {
                        self.snapshot_requested.store(false, Ordering::Release);
                        info!(%slot, step = %res.step, "📸 抓拍完成");
                    }
                },
            }
        }
    }

    pub fn exam_active(&self) -> bool {
        self.exam_active.load(Ordering::Acquire)
    }

    /// 切换考试状态, 返回切换前的状态.
    /// 进入考试时清空考试标志与账本; 结束考试时按服务规则清空复位状态.
    pub fn set_exam_active(&self, active: bool) -> bool {
        let mut ledger = self.ledger.lock();
        let previous = self.exam_active.swap(active, Ordering::AcqRel);
        if active && !previous {
            self.clear_exam_state(&mut ledger);
        }
        if !active && previous && self.rules.reset_on_exam_stop() {
            self.reset_flags.fill(false);
            ledger.clear_reset();
        }
        previous
    }

    pub fn init_exam_variables(&self) {
        let mut ledger = self.ledger.lock();
        self.clear_exam_state(&mut ledger);
    }

    fn clear_exam_state(&self, ledger: &mut Ledger) {
        self.exam_flags.fill(false);
        self.status_flags.fill(false);
        self.tallies.clear();
        self.snapshot_requested.store(false, Ordering::Release);
        ledger.clear_exam();
    }

    pub fn init_reset_variables(&self) {
        let mut ledger = self.ledger.lock();
        self.reset_flags.fill(false);
        ledger.clear_reset();
    }

    pub fn exam_flags(&self) -> Vec<bool> {
        self.exam_flags.snapshot()
    }

    pub fn reset_flags(&self) -> Vec<bool> {
        self.reset_flags.snapshot()
    }

    pub fn status_flags(&self) -> Vec<bool> {
        self.status_flags.snapshot()
    }

    /// (名称, 数量), 顺序同 `ExamRules::tally_items`
    pub fn tallies(&self) -> Vec<(&'static str, u32)> {
        self.rules
            .tally_items()
            .iter()
            .zip(self.tallies.snapshot())
            .map(|(item, n)| (item.name, n))
            .collect()
    }

    /// 请求抓拍; 服务不支持抓拍时返回 false
    pub fn request_snapshot(&self) -> bool {
        if self.rules.snapshot().is_none() {
            return false;
        }
        self.snapshot_requested.store(true, Ordering::Release);
        true
    }

    pub fn snapshot(&self, step: &str) -> Option<String> {
        self.ledger.lock().snapshots.get(step).cloned()
    }

    pub fn any_reset_flag(&self) -> bool {
        self.reset_flags.any()
    }

    pub fn reset_images(&self) -> BTreeMap<String, String> {
        self.ledger.lock().reset_images.clone()
    }

    pub fn exam_order(&self) -> Vec<String> {
        self.ledger.lock().exam_order.clone()
    }

    pub fn exam_images(&self) -> BTreeMap<String, String> {
        self.ledger.lock().exam_images.clone()
    }

    pub fn exam_scores(&self) -> BTreeMap<String, u32> {
        self.ledger.lock().exam_scores.clone()
    }

    /// 一次加锁取出完整账本
    pub fn ledger(&self) -> Ledger {
        self.ledger.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Bbox;
    use crate::processor::rules::{ScorePolicy, StepTable, Tally};
    use std::sync::Arc;

    const TALLY: [Tally; 1] = [Tally::new("b", 2)];

    /// 两个模型: m0 看到 "a" 锁存 0, 看到 "b" 锁存 1 (需要 0 已完成);
    /// m1 看到 "c" 置复位标志 0, 否则清除; 状态 0 跟随 "c", 计数 "b" 的个数
    struct ToyRules {
        exam: StepTable,
        reset: StepTable,
    }

    impl ToyRules {
        fn new() -> Self {
            Self {
                exam: StepTable::new(2).steps(0, [(0, "toy_step_1"), (1, "toy_step_2")]),
                reset: StepTable::new(2).steps(1, [(0, "reset_step_1")]),
            }
        }
    }

    impl ExamRules for ToyRules {
        fn name(&self) -> &'static str {
            "toy"
        }
        fn model_count(&self) -> usize {
            2
        }
        fn exam_flag_count(&self) -> usize {
            2
        }
        fn reset_flag_count(&self) -> usize {
            1
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
        fn status_flag_count(&self) -> usize {
            1
        }
        fn tally_items(&self) -> &[Tally] {
            &TALLY
        }
        fn snapshot(&self) -> Option<(ModelSlot, &'static str)> {
            Some((ModelSlot(1), "toy_snapshot"))
        }
        fn evaluate(&self, slot: ModelSlot, result: &InferenceResult, flags: &mut FlagUpdates<'_>) {
            match slot.index() {
                0 => {
                    if result.bboxes().is_none() {
                        return;
                    }
                    if result.has_class("a") {
                        flags.latch(0);
                    }
                    if result.has_class("b") && flags.exam(0) {
                        flags.latch(1);
                    }
                }
                _ => {
                    flags.set_reset(0, result.has_class("c"));
                    flags.set_status(0, result.has_class("c"));
                    let n = result.bboxes().map_or(0, |b| b.iter().filter(|b| b.id() == 1).count());
                    flags.tally(0, n as u32);
                }
            }
        }
    }

    fn result(classes: &[usize]) -> InferenceResult {
        InferenceResult::new(Arc::new(vec!["a".into(), "b".into(), "c".into()])).with_bboxes(
            classes
                .iter()
                .map(|&c| Bbox::from_xyxy(1., 1., 5., 5., c, 0.9))
                .collect(),
        )
    }

    fn processor(dir: &std::path::Path) -> ResultProcessor {
        ResultProcessor::new(
            Box::new(ToyRules::new()),
            ImageStore::new(dir, "/img").unwrap(),
        )
    }

    fn files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn repeated_flag_captures_once() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);
        p.set_exam_active(true);

        p.process_result(ModelSlot(0), &result(&[0]), &frame);
        p.process_result(ModelSlot(0), &result(&[0]), &frame);

        assert_eq!(p.exam_order(), vec!["toy_step_1".to_string()]);
        assert_eq!(p.exam_images().len(), 1);
        assert_eq!(files(dir.path()), 1);
        assert_eq!(p.exam_scores()["toy_step_1"], 50);
    }

    #[test]
    fn exam_flags_stay_latched_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);
        p.set_exam_active(true);

        p.process_result(ModelSlot(0), &result(&[1]), &frame);
        assert_eq!(p.exam_flags(), vec![false, false]);
        p.process_result(ModelSlot(0), &result(&[0]), &frame);
        p.process_result(ModelSlot(0), &result(&[]), &frame);
        p.process_result(ModelSlot(0), &result(&[1]), &frame);
        assert_eq!(p.exam_flags(), vec![true, true]);
        assert_eq!(p.exam_order(), vec!["toy_step_1", "toy_step_2"]);

        p.init_exam_variables();
        assert_eq!(p.exam_flags(), vec![false, false]);
        assert!(p.exam_order().is_empty());
    }

    #[test]
    fn reset_capture_only_outside_exam() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);

        p.process_result(ModelSlot(1), &result(&[2]), &frame);
        assert_eq!(p.reset_flags(), vec![true]);
        assert_eq!(p.reset_images().len(), 1);

        // 电平触发: 物体归位后立即清除
        p.process_result(ModelSlot(1), &result(&[]), &frame);
        assert_eq!(p.reset_flags(), vec![false]);

        p.init_reset_variables();
        p.set_exam_active(true);
        p.process_result(ModelSlot(1), &result(&[2]), &frame);
        assert!(p.any_reset_flag());
        assert!(p.reset_images().is_empty());
    }

    #[test]
    fn exam_capture_requires_active_exam() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);

        p.process_result(ModelSlot(0), &result(&[0]), &frame);
        assert_eq!(p.exam_flags(), vec![true, false]);
        assert!(p.exam_order().is_empty());

        assert!(!p.set_exam_active(true));
        assert!(p.set_exam_active(true));
        assert_eq!(p.exam_flags(), vec![false, false]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    #[cfg(debug_assertions)]
    fn unknown_slot_panics_in_debug() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        p.process_result(ModelSlot(5), &result(&[0]), &RgbImage::new(4, 4));
    }

    #[test]
    fn failed_capture_is_retried_on_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let p = ResultProcessor::new(
            Box::new(ToyRules::new()),
            ImageStore::new(&images, "/img").unwrap(),
        );
        let frame = RgbImage::new(16, 16);
        p.set_exam_active(true);

        std::fs::remove_dir_all(&images).unwrap();
        p.process_result(ModelSlot(0), &result(&[0]), &frame);
        assert!(p.exam_order().is_empty());

        std::fs::create_dir_all(&images).unwrap();
        p.process_result(ModelSlot(0), &result(&[0]), &frame);
        assert_eq!(p.exam_order(), vec!["toy_step_1"]);
        assert_eq!(files(&images), 1);
    }

    #[test]
    fn concurrent_frames_capture_each_step_once() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(64, 64);
        p.set_exam_active(true);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..4 {
                        p.process_result(ModelSlot(0), &result(&[0]), &frame);
                        // 截图写盘期间账本仍可读
                        let _ = p.exam_flags();
                        let _ = p.ledger();
                    }
                });
            }
        });
        assert_eq!(p.exam_order(), vec!["toy_step_1"]);
        assert_eq!(files(dir.path()), 1);
    }

    #[test]
    fn snapshot_taken_once_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);

        p.process_result(ModelSlot(1), &result(&[]), &frame);
        assert!(p.snapshot("toy_snapshot").is_none());

        assert!(p.request_snapshot());
        p.process_result(ModelSlot(0), &result(&[]), &frame);
        assert!(p.snapshot("toy_snapshot").is_none());
        p.process_result(ModelSlot(1), &result(&[]), &frame);
        p.process_result(ModelSlot(1), &result(&[]), &frame);
        assert!(p.snapshot("toy_snapshot").unwrap().starts_with("/img/toy_snapshot_"));
        assert_eq!(files(dir.path()), 1);

        p.init_exam_variables();
        assert!(p.snapshot("toy_snapshot").is_none());
    }

    #[test]
    fn status_and_tallies_follow_rules() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path());
        let frame = RgbImage::new(16, 16);
        p.set_exam_active(true);

        p.process_result(ModelSlot(1), &result(&[1, 1, 1, 2]), &frame);
        assert_eq!(p.status_flags(), vec![true]);
        // 上限 2
        assert_eq!(p.tallies(), vec![("b", 2)]);

        p.process_result(ModelSlot(1), &result(&[1]), &frame);
        assert_eq!(p.status_flags(), vec![false]);
        assert_eq!(p.tallies(), vec![("b", 2)]);

        p.init_exam_variables();
        assert_eq!(p.status_flags(), vec![false]);
        assert_eq!(p.tallies(), vec![("b", 0)]);
    }
}
