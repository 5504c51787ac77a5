/// 结果处理系统 (Result Processing System)
///
/// 推理结果 → 标志更新 → 步骤截图 → 完成顺序/分数
/// - rules:            ExamRules 接口、步骤表、打分策略
/// - result_processor: 通用处理器, 持有标志与账本
/// - capture:          截图叠加与落盘
/// - state:            原子标志数组与账本
pub mod capture;
pub mod result_processor;
pub mod rules;
pub mod state;

pub use capture::{annotate, ImageStore};
pub use result_processor::ResultProcessor;
pub use rules::{ExamRules, FlagUpdates, ScorePolicy, StepTable, Tally};
pub use state::{FlagVec, Ledger, StepKind, TallyVec};
