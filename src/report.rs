/// 控制层应答 (Control Replies)
///
/// 每个控制命令对应一个可直接序列化为 JSON 的应答, 字段名与现有前端约定一致.
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::manager::{DetectionManager, StartStatus, StopStatus};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    AlreadyRunning,
    NoDetectionRunning,
    NoExamRunning,
    ResetAll,
    NotResetAll,
    #[serde(rename = "IN_POSTION")]
    InPosition,
    #[serde(rename = "NOT_IN_POSTION")]
    NotInPosition,
    /// 当前服务没有该项检查
    NotApplicable,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: Status,
}

impl From<Status> for StatusReport {
    fn from(status: Status) -> Self {
        Self { status }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetStep {
    #[serde(rename = "resetStep")]
    pub reset_step: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExamStep {
    pub step: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataReport<T> {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<T>>,
}

impl<T> DataReport<T> {
    fn status(status: Status) -> Self {
        Self { status, data: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WearingItem {
    pub name: String,
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WearingStatusReport {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<WearingItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl From<Status> for WearingStatusReport {
    fn from(status: Status) -> Self {
        Self {
            status,
            data: None,
            image: None,
        }
    }
}

pub type ResetStatusReport = DataReport<ResetStep>;
pub type ExamStatusReport = DataReport<ExamStep>;

/// 取步骤名末尾的序号: `welding_exam_12` → `12`
pub fn step_number(step: &str) -> Option<&str> {
    static STEP_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STEP_RE.get_or_init(|| Regex::new(r"_(\d+)$").ok()).as_ref()?;
    re.captures(step)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn number_or_name(step: &str) -> String {
    step_number(step).unwrap_or(step).to_string()
}

pub fn start_detection(manager: &DetectionManager) -> Result<StatusReport> {
    Ok(match manager.start()? {
        StartStatus::Started => Status::Success,
        StartStatus::AlreadyRunning => Status::AlreadyRunning,
    }
    .into())
}

pub fn stop_detection(manager: &DetectionManager) -> StatusReport {
    match manager.stop() {
        StopStatus::Stopped => Status::Success,
        StopStatus::NotRunning => Status::NoDetectionRunning,
    }
    .into()
}

pub fn start_exam(manager: &DetectionManager) -> StatusReport {
    match manager.set_exam_status(true) {
        None => Status::NoDetectionRunning,
        Some(true) => Status::AlreadyRunning,
        Some(false) => Status::Success,
    }
    .into()
}

pub fn stop_exam(manager: &DetectionManager) -> StatusReport {
    if !manager.get_exam_status() {
        return Status::NoExamRunning.into();
    }
    manager.set_exam_status(false);
    Status::Success.into()
}

/// 查询复位状态; 返回未复位列表后清空复位记录
pub fn reset_status(manager: &DetectionManager) -> ResetStatusReport {
    let (Some(flags), Some(images)) = (manager.get_reset_flag(), manager.get_reset_images()) else {
        return DataReport::status(Status::NoDetectionRunning);
    };
    if !manager.tracks_reset() {
        return DataReport::status(Status::NotApplicable);
    }
    if !flags.iter().any(|&f| f) {
        return DataReport::status(Status::ResetAll);
    }

    let data = reset_steps(&images);
    info!(pending = data.len(), "复位检查: 存在未复位项");
    manager.init_reset_variables();
    DataReport {
        status: Status::NotResetAll,
        data: Some(data),
    }
}

fn reset_steps(images: &BTreeMap<String, String>) -> Vec<ResetStep> {
    let mut steps: Vec<_> = images
        .iter()
        .map(|(step, image)| ResetStep {
            reset_step: number_or_name(step),
            image: image.clone(),
        })
        .collect();
    steps.sort_by_key(|s| s.reset_step.parse::<u32>().unwrap_or(u32::MAX));
    steps
}

/// 按完成顺序列出已截图的考试步骤
pub fn exam_status(manager: &DetectionManager) -> ExamStatusReport {
    let order = manager.get_exam_order().unwrap_or_default();
    if order.is_empty() {
        return DataReport::status(Status::None);
    }
    let images = manager.get_exam_images().unwrap_or_default();
    let scores = manager.get_exam_score().unwrap_or_default();
    DataReport {
        status: Status::Success,
        data: Some(exam_steps(&order, &images, &scores)),
    }
}

fn exam_steps(
    order: &[String],
    images: &BTreeMap<String, String>,
    scores: &BTreeMap<String, u32>,
) -> Vec<ExamStep> {
    order
        .iter()
        .map(|step| ExamStep {
            step: number_or_name(step),
            image: images.get(step).cloned().unwrap_or_default(),
            score: scores.get(step).copied(),
        })
        .collect()
}

/// 开始穿戴检查, 即启动检测
pub fn wearing_detection(manager: &DetectionManager) -> Result<StatusReport> {
    start_detection(manager)
}

/// 结束穿戴检查, 即停止检测
pub fn end_wearing_exam(manager: &DetectionManager) -> StatusReport {
    stop_detection(manager)
}

pub fn human_position_status(manager: &DetectionManager) -> StatusReport {
    match manager.get_status_flags() {
        None => Status::NoDetectionRunning,
        Some(flags) if flags.first().copied().unwrap_or(false) => Status::InPosition,
        Some(_) => Status::NotInPosition,
    }
    .into()
}

/// 抓拍一张穿戴画面并返回计数, 随后清空本轮穿戴记录
pub fn wearing_status(manager: &DetectionManager) -> WearingStatusReport {
    let Some(step) = manager.result_processor().and_then(|p| p.rules().snapshot()).map(|(_, s)| s)
    else {
        return Status::None.into();
    };
    if !manager.request_snapshot() {
        return Status::None.into();
    }

    let wait = manager.config().runtime.snapshot_wait();
    let Some(image) = poll(wait, || manager.get_snapshot(step)) else {
        info!("未取得穿戴抓拍");
        return Status::None.into();
    };
    let Some(tallies) = manager.get_tallies() else {
        return Status::None.into();
    };

    let data = tallies
        .into_iter()
        .map(|(name, number)| WearingItem {
            name: name.to_string(),
            number,
        })
        .collect();
    manager.init_exam_variables();
    WearingStatusReport {
        status: Status::Success,
        data: Some(data),
        image: Some(image),
    }
}

fn poll<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_trailing_step_number() {
        assert_eq!(step_number("welding_exam_12"), Some("12"));
        assert_eq!(step_number("reset_step_3"), Some("3"));
        assert_eq!(step_number("basket_step_1"), Some("1"));
        assert_eq!(step_number("cleanup"), None);
    }

    #[test]
    fn status_reports_serialise_screaming_case() {
        let v = serde_json::to_value(StatusReport::from(Status::NoDetectionRunning)).unwrap();
        assert_eq!(v, json!({ "status": "NO_DETECTION_RUNNING" }));
        let v = serde_json::to_value(ResetStatusReport::status(Status::ResetAll)).unwrap();
        assert_eq!(v, json!({ "status": "RESET_ALL" }));
    }

    #[test]
    fn reset_report_uses_camel_case_step_field() {
        let images = BTreeMap::from([
            ("reset_step_6".to_string(), "/img/reset_step_6_a.jpg".to_string()),
            ("reset_step_10".to_string(), "/img/reset_step_10_a.jpg".to_string()),
            ("reset_step_1".to_string(), "/img/reset_step_1_a.jpg".to_string()),
        ]);
        let report = ResetStatusReport {
            status: Status::NotResetAll,
            data: Some(reset_steps(&images)),
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "status": "NOT_RESET_ALL",
                "data": [
                    { "resetStep": "1", "image": "/img/reset_step_1_a.jpg" },
                    { "resetStep": "6", "image": "/img/reset_step_6_a.jpg" },
                    { "resetStep": "10", "image": "/img/reset_step_10_a.jpg" }
                ]
            })
        );
    }

    #[test]
    fn exam_report_keeps_completion_order_and_optional_score() {
        let order = vec!["welding_exam_7".to_string(), "welding_exam_1".to_string()];
        let images = BTreeMap::from([
            ("welding_exam_1".to_string(), "/img/1.jpg".to_string()),
            ("welding_exam_7".to_string(), "/img/7.jpg".to_string()),
        ]);
        let scores = BTreeMap::from([("welding_exam_7".to_string(), 4)]);

        let steps = exam_steps(&order, &images, &scores);
        assert_eq!(
            serde_json::to_value(&steps).unwrap(),
            json!([
                { "step": "7", "image": "/img/7.jpg", "score": 4 },
                { "step": "1", "image": "/img/1.jpg" }
            ])
        );
    }

    #[test]
    fn wearing_report_shape() {
        let report = WearingStatusReport {
            status: Status::Success,
            data: Some(vec![WearingItem {
                name: "gloves".into(),
                number: 2,
            }]),
            image: Some("/img/welding_wearing_1.jpg".into()),
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "status": "SUCCESS",
                "data": [{ "name": "gloves", "number": 2 }],
                "image": "/img/welding_wearing_1.jpg"
            })
        );
        let v = serde_json::to_value(StatusReport::from(Status::NotInPosition)).unwrap();
        assert_eq!(v, json!({ "status": "NOT_IN_POSTION" }));
        let v = serde_json::to_value(WearingStatusReport::from(Status::None)).unwrap();
        assert_eq!(v, json!({ "status": "NONE" }));
    }

    #[test]
    fn poll_gives_up_after_timeout() {
        let mut calls = 0;
        assert_eq!(
            poll(Duration::from_millis(30), || {
                calls += 1;
                None::<()>
            }),
            None
        );
        assert!(calls >= 2);
        assert_eq!(poll(Duration::ZERO, || Some(7)), Some(7));
    }
}
