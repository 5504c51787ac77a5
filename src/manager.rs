/// 检测管理器 (Detection Manager)
///
/// 应用级单例, 启动时构造一次, 以引用传给控制层.
/// 启动顺序: 规则处理器 → 帧总线 → 推理线程 → 拉流线程;
/// 停止顺序相反: 先停生产者 (拉流), 再停消费者 (推理).
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::detection::ModelSlot;
use crate::input::CaptureBackend;
use crate::models::ModelLoader;
use crate::pipeline::signal::{stop_signal, StopTrigger};
use crate::pipeline::{FrameBus, InferenceManager, StopSignal, StreamManager};
use crate::processor::{ImageStore, ResultProcessor};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    NotRunning,
}

struct Running {
    streams: StreamManager,
    inference: InferenceManager,
    bus: Arc<FrameBus>,
    processor: Arc<ResultProcessor>,
}

/// 管理器生命周期; 启动期间持有取消触发端
enum Lifecycle {
    Idle,
    Starting(StopTrigger),
    Running(Running),
}

pub struct DetectionManager {
    config: ServerConfig,
    capture: Arc<dyn CaptureBackend>,
    loader: Arc<dyn ModelLoader>,
    state: Mutex<Lifecycle>,
    state_changed: Condvar,
    processor: RwLock<Option<Arc<ResultProcessor>>>,
}

impl DetectionManager {
    /// 校验配置, 不启动任何线程
    pub fn new(
        config: ServerConfig,
        capture: Arc<dyn CaptureBackend>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        config.validate()?;
        // 区域配置有误时尽早失败
        config.service.build_rules(config.regions.as_ref())?;
        Ok(Self {
            config,
            capture,
            loader,
            state: Mutex::new(Lifecycle::Idle),
            state_changed: Condvar::new(),
            processor: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// 启动全部线程, 阻塞直到所有启动屏障触发.
    /// 等待屏障时不持有状态锁, 期间调用 `stop` 会取消本次启动.
    pub fn start(&self) -> Result<StartStatus> {
        let (trigger, cancel) = stop_signal();
        {
            let mut state = self.state.lock();
            if !matches!(*state, Lifecycle::Idle) {
                warn!("检测服务已在运行");
                return Ok(StartStatus::AlreadyRunning);
            }
            *state = Lifecycle::Starting(trigger);
        }
        let t_start = Instant::now();

        let launched = self.launch(&cancel);

        let mut state = self.state.lock();
        let cancelled = matches!(&*state, Lifecycle::Starting(t) if t.is_triggered());
        let launched = match launched {
            Ok(running) if cancelled => {
                MutexGuard::unlocked(&mut state, || self.teardown(running));
                Err(Error::StartCancelled)
            }
            other => other,
        };

        match launched {
            Ok(running) => {
                *self.processor.write() = Some(running.processor.clone());
                *state = Lifecycle::Running(running);
                info!(
                    service = %self.config.service,
                    models = self.config.models.len(),
                    streams = self.config.streams.len(),
                    elapsed = ?t_start.elapsed(),
                    "🚀 检测服务已启动"
                );
                Ok(StartStatus::Started)
            }
            Err(e) => {
                *state = Lifecycle::Idle;
                self.state_changed.notify_all();
                Err(e)
            }
        }
    }

    /// 规则处理器 → 帧总线 → 推理线程 → 拉流线程
    fn launch(&self, cancel: &StopSignal) -> Result<Running> {
        let runtime = &self.config.runtime;

        let rules = self.config.service.build_rules(self.config.regions.as_ref())?;
        let store = ImageStore::new(&self.config.images_dir, &self.config.img_url_path)?;
        let processor = Arc::new(ResultProcessor::new(rules, store));
        let bus = Arc::new(FrameBus::new(
            self.config.models.len(),
            self.config.queue_size(),
        ));

        let inference = InferenceManager::start(
            &self.config.models,
            self.loader.clone(),
            bus.clone(),
            processor.clone(),
            runtime,
            cancel,
        )?;

        let streams = match StreamManager::start(
            &self.config.streams,
            self.capture.clone(),
            bus.clone(),
            runtime,
            cancel,
        ) {
            Ok(streams) => streams,
            Err(e) => {
                error!("❌ 视频流启动失败, 停止推理线程: {e}");
                inference.stop(runtime);
                return Err(e);
            }
        };

        Ok(Running {
            streams,
            inference,
            bus,
            processor,
        })
    }

    /// 先停生产者 (拉流), 再停消费者 (推理)
    fn teardown(&self, running: Running) {
        let Running {
            streams,
            inference,
            bus,
            ..
        } = running;
        let runtime = &self.config.runtime;
        let t_stop = Instant::now();

        streams.stop(runtime);
        inference.stop(runtime);

        let dropped: u64 = (0..bus.len())
            .filter_map(|i| bus.queue(ModelSlot(i)))
            .map(|q| q.dropped())
            .sum();
        *self.processor.write() = None;
        info!(dropped, elapsed = ?t_stop.elapsed(), "🛑 检测服务已停止");
    }

    /// 停止全部线程; 未运行时为空操作. 正在启动时取消启动并等待其回滚
    pub fn stop(&self) -> StopStatus {
        let mut state = self.state.lock();
        let starting = match &*state {
            Lifecycle::Idle => return StopStatus::NotRunning,
            Lifecycle::Starting(trigger) => {
                trigger.trigger();
                true
            }
            Lifecycle::Running(_) => false,
        };
        if starting {
            info!("⏹️ 启动过程中收到停止请求, 等待回滚");
            while matches!(*state, Lifecycle::Starting(_)) {
                self.state_changed.wait(&mut state);
            }
        }

        if let Lifecycle::Running(running) = std::mem::replace(&mut *state, Lifecycle::Idle) {
            self.teardown(running);
        }
        StopStatus::Stopped
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Running(_))
    }

    fn processor(&self) -> Option<Arc<ResultProcessor>> {
        self.processor.read().clone()
    }

    /// 切换考试状态, 返回切换前的状态; 检测未运行时返回 `None`
    pub fn set_exam_status(&self, active: bool) -> Option<bool> {
        let processor = self.processor()?;
        let previous = processor.set_exam_active(active);
        if previous != active {
            info!(active, "📝 考试状态切换");
        }
        Some(previous)
    }

    pub fn get_exam_status(&self) -> bool {
        self.processor().is_some_and(|p| p.exam_active())
    }

    pub fn get_reset_flag(&self) -> Option<Vec<bool>> {
        self.processor().map(|p| p.reset_flags())
    }

    pub fn get_reset_images(&self) -> Option<BTreeMap<String, String>> {
        self.processor().map(|p| p.reset_images())
    }

    pub fn get_exam_order(&self) -> Option<Vec<String>> {
        self.processor().map(|p| p.exam_order())
    }

    pub fn get_exam_images(&self) -> Option<BTreeMap<String, String>> {
        self.processor().map(|p| p.exam_images())
    }

    pub fn get_exam_score(&self) -> Option<BTreeMap<String, u32>> {
        self.processor().map(|p| p.exam_scores())
    }

    /// 服务是否有复位检查
    pub fn tracks_reset(&self) -> bool {
        self.processor()
            .is_some_and(|p| p.rules().reset_steps().total_steps() > 0)
    }

    pub fn get_status_flags(&self) -> Option<Vec<bool>> {
        self.processor().map(|p| p.status_flags())
    }

    pub fn get_tallies(&self) -> Option<Vec<(&'static str, u32)>> {
        self.processor().map(|p| p.tallies())
    }

    /// 请求抓拍; 检测未运行或服务不支持时返回 false
    pub fn request_snapshot(&self) -> bool {
        self.processor().is_some_and(|p| p.request_snapshot())
    }

    pub fn get_snapshot(&self, step: &str) -> Option<String> {
        self.processor()?.snapshot(step)
    }

    pub fn init_exam_variables(&self) {
        if let Some(p) = self.processor() {
            p.init_exam_variables();
        }
    }

    pub fn init_reset_variables(&self) {
        if let Some(p) = self.processor() {
            p.init_reset_variables();
        }
    }

    /// 当前会话的规则处理器
    pub fn result_processor(&self) -> Option<Arc<ResultProcessor>> {
        self.processor()
    }
}

impl Drop for DetectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
