/// 推理线程 (Inference Worker)
///
/// 每个模型槽位一个线程: 启动时加载一次权重 → 触发启动屏障 →
/// 循环 出队 → 推理 → 交给规则处理器. 单帧推理失败只记日志, 不退出.
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::bus::FrameBus;
use super::signal::{start_barrier, wait_all, BarrierOutcome, BarrierSignal, StopSignal};
use super::worker::WorkerHandle;
use crate::config::{ModelConfig, RuntimeConfig};
use crate::detection::ModelSlot;
use crate::models::ModelLoader;
use crate::processor::ResultProcessor;
use crate::{Error, Result};

/// 推理线程主循环
pub fn inference_worker(
    slot: ModelSlot,
    config: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    bus: Arc<FrameBus>,
    processor: Arc<ResultProcessor>,
    mut barrier: BarrierSignal,
    stop: StopSignal,
) {
    let t_load = Instant::now();
    let mut predictor = match loader.load(slot, &config) {
        Ok(p) => p,
        Err(e) => {
            // 不触发屏障, 管理器据此判定启动失败
            error!(%slot, weights = %config.weights.display(), "❌ 模型加载失败: {e:#}");
            return;
        }
    };
    info!(%slot, weights = %config.weights.display(), elapsed = ?t_load.elapsed(), "✅ 模型加载完成");
    barrier.fire();

    let mut processed: u64 = 0;
    while let Some(frame) = bus.dequeue(slot, &stop) {
        let t_run = Instant::now();
        match predictor.predict(&frame.image) {
            Ok(result) => {
                processor.process_result(slot, &result, &frame.image);
                processed += 1;
                debug!(%slot, camera = frame.camera, seq = frame.seq, elapsed = ?t_run.elapsed(), "frame processed");
            }
            Err(e) => {
                warn!(%slot, camera = frame.camera, seq = frame.seq, "⚠️ 推理失败, 丢弃该帧: {e:#}");
            }
        }
        if stop.is_set() {
            break;
        }
    }

    info!(%slot, processed, "推理线程退出");
}

/// 管理所有推理线程
pub struct InferenceManager {
    workers: Vec<WorkerHandle>,
}

impl InferenceManager {
    /// 启动全部推理线程, 阻塞直到每个模型都加载完成
    pub fn start(
        models: &[ModelConfig],
        loader: Arc<dyn ModelLoader>,
        bus: Arc<FrameBus>,
        processor: Arc<ResultProcessor>,
        runtime: &RuntimeConfig,
        cancel: &StopSignal,
    ) -> Result<Self> {
        let mut manager = Self {
            workers: Vec::with_capacity(models.len()),
        };
        let mut waiters = Vec::with_capacity(models.len());

        for (index, config) in models.iter().enumerate() {
            let slot = ModelSlot(index);
            let (signal, waiter) = start_barrier();
            let (config, loader, bus, processor) =
                (config.clone(), loader.clone(), bus.clone(), processor.clone());
            match WorkerHandle::spawn(format!("inference-{index}"), move |stop| {
                inference_worker(slot, config, loader, bus, processor, signal, stop)
            }) {
                Ok(handle) => manager.workers.push(handle),
                Err(e) => {
                    manager.stop(runtime);
                    return Err(e);
                }
            }
            waiters.push(waiter);
        }

        if let Err((index, outcome)) = wait_all(&waiters, runtime.start_timeout(), cancel) {
            manager.stop(runtime);
            return Err(match outcome {
                BarrierOutcome::Cancelled => Error::StartCancelled,
                BarrierOutcome::Abandoned => Error::ModelLoad {
                    path: models[index].weights.clone(),
                    reason: "inference worker exited during startup".into(),
                },
                _ => Error::StartTimeout {
                    worker: format!("inference-{index}"),
                    secs: runtime.start_timeout().as_secs(),
                },
            });
        }

        info!(models = manager.workers.len(), "✅ 全部推理线程就绪");
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn stop(self, runtime: &RuntimeConfig) {
        for worker in &self.workers {
            worker.signal_stop();
        }
        for worker in self.workers {
            worker.shutdown(runtime.stop_grace(), runtime.kill_grace());
        }
    }
}
