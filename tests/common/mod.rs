#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use parking_lot::Mutex;

use exam_sentinel::input::SyntheticBackend;
use exam_sentinel::{
    CaptureBackend, InferenceResult, ModelConfig, ModelLoader, ModelSlot, ModelTask, Predictor,
    ServerConfig, ServiceKind, StreamConfig, VideoCapture,
};

/// 跨线程事件记录
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn last_position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// 记录打开/关闭事件的采集后端
pub struct RecordingBackend {
    pub inner: SyntheticBackend,
    pub log: EventLog,
}

impl CaptureBackend for RecordingBackend {
    fn open(&self, url: &str) -> exam_sentinel::Result<Box<dyn VideoCapture>> {
        self.log.push(format!("open {url}"));
        let inner = self.inner.open(url)?;
        Ok(Box::new(RecordingCapture {
            inner,
            url: url.to_string(),
            log: self.log.clone(),
        }))
    }
}

struct RecordingCapture {
    inner: Box<dyn VideoCapture>,
    url: String,
    log: EventLog,
}

impl VideoCapture for RecordingCapture {
    fn grab(&mut self) -> exam_sentinel::Result<()> {
        self.inner.grab()
    }

    fn retrieve(&mut self) -> exam_sentinel::Result<RgbImage> {
        self.inner.retrieve()
    }
}

impl Drop for RecordingCapture {
    fn drop(&mut self) {
        self.log.push(format!("close {}", self.url));
    }
}

pub type Respond = Arc<dyn Fn(ModelSlot) -> InferenceResult + Send + Sync>;

/// 按槽位返回固定结果的加载器
pub struct ScriptedLoader {
    pub log: EventLog,
    pub fail_slot: Option<usize>,
    pub respond: Respond,
}

impl ScriptedLoader {
    pub fn new(log: EventLog, respond: Respond) -> Self {
        Self {
            log,
            fail_slot: None,
            respond,
        }
    }

    pub fn empty(log: EventLog) -> Self {
        Self::new(log, Arc::new(|_| InferenceResult::default()))
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, slot: ModelSlot, _config: &ModelConfig) -> anyhow::Result<Box<dyn Predictor>> {
        self.log.push(format!("load {slot}"));
        if self.fail_slot == Some(slot.index()) {
            anyhow::bail!("weights not found");
        }
        Ok(Box::new(ScriptedPredictor {
            slot,
            log: self.log.clone(),
            respond: self.respond.clone(),
        }))
    }
}

struct ScriptedPredictor {
    slot: ModelSlot,
    log: EventLog,
    respond: Respond,
}

impl Predictor for ScriptedPredictor {
    fn predict(&mut self, _image: &RgbImage) -> anyhow::Result<InferenceResult> {
        Ok((self.respond)(self.slot))
    }
}

impl Drop for ScriptedPredictor {
    fn drop(&mut self) {
        self.log.push(format!("unload {}", self.slot));
    }
}

/// 单路摄像头喂给全部模型的测试配置
pub fn config(service: ServiceKind, images_dir: &Path) -> ServerConfig {
    let mut config = ServerConfig::new(service, images_dir, "/static/images");
    let models = service.model_count();
    config.models = (0..models)
        .map(|i| ModelConfig::new(format!("weights/m{i}.onnx"), ModelTask::Detect))
        .collect();
    config.streams = vec![StreamConfig::new("rtsp://cam0", 0..models).with_frame_skip(1)];
    config.runtime.start_timeout_secs = 2;
    config.runtime.stop_grace_ms = 500;
    config.runtime.kill_grace_ms = 500;
    config.runtime.reconnect_initial_ms = 10;
    config.runtime.reconnect_max_ms = 50;
    config
}

pub fn endless_camera(log: &EventLog) -> Arc<RecordingBackend> {
    Arc::new(RecordingBackend {
        inner: SyntheticBackend::endless().with_frame_interval(Duration::from_millis(5)),
        log: log.clone(),
    })
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
