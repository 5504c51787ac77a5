/// 拉流线程 (Stream Worker)
///
/// 每路摄像头一个线程:
/// Connecting → Streaming → (出错) Reconnecting → Connecting → … → Stopped
///
/// - 每次 grab 计数, 只有第 frame_skip 的整数倍帧才解码并分发
/// - 断流后按 1s 起步、翻倍、封顶 60s 的间隔重连, 重连成功后复位
/// - 停止信号在两帧之间以及退避睡眠中都会被及时响应
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::bus::FrameBus;
use super::signal::{start_barrier, wait_all, BarrierOutcome, BarrierSignal, StopSignal};
use super::worker::WorkerHandle;
use crate::config::{RuntimeConfig, StreamConfig};
use crate::detection::Frame;
use crate::input::{CaptureBackend, VideoCapture};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// 指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 取出本次等待时长并翻倍
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

pub struct StreamWorker {
    camera: usize,
    config: StreamConfig,
    backend: Arc<dyn CaptureBackend>,
    bus: Arc<FrameBus>,
    backoff: Backoff,
    state: StreamState,
}

impl StreamWorker {
    pub fn new(
        camera: usize,
        config: StreamConfig,
        backend: Arc<dyn CaptureBackend>,
        bus: Arc<FrameBus>,
        backoff: Backoff,
    ) -> Self {
        Self {
            camera,
            config,
            backend,
            bus,
            backoff,
            state: StreamState::Connecting,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            debug!(camera = self.camera, from = ?self.state, to = ?state, "stream state");
            self.state = state;
        }
    }

    pub fn run(mut self, mut barrier: BarrierSignal, stop: StopSignal) {
        info!(camera = self.camera, url = %self.config.rtsp_url, "📹 拉流线程启动");

        while !stop.is_set() {
            self.set_state(StreamState::Connecting);
            match self.backend.open(&self.config.rtsp_url) {
                Ok(mut device) => {
                    self.backoff.reset();
                    self.set_state(StreamState::Streaming);
                    info!(camera = self.camera, "✅ 视频流已连接");
                    let result = self.stream(device.as_mut(), &mut barrier, &stop);
                    drop(device);
                    match result {
                        Ok(()) => break,
                        Err(e) => warn!(camera = self.camera, "⚠️ 视频流中断: {e}"),
                    }
                }
                Err(e) => warn!(camera = self.camera, "⚠️ 视频流连接失败: {e}"),
            }

            if stop.is_set() {
                break;
            }
            self.set_state(StreamState::Reconnecting);
            let delay = self.backoff.next_delay();
            info!(camera = self.camera, delay_ms = delay.as_millis() as u64, "🔄 等待重连");
            if stop.sleep(delay) {
                break;
            }
        }

        self.set_state(StreamState::Stopped);
        info!(camera = self.camera, "拉流线程退出");
    }

    /// 读帧循环. 收到停止信号返回 Ok, 设备出错返回 Err
    pub(crate) fn stream(
        &mut self,
        device: &mut dyn VideoCapture,
        barrier: &mut BarrierSignal,
        stop: &StopSignal,
    ) -> Result<()> {
        let frame_skip = u64::from(self.config.frame_skip.max(1));
        let mut counter: u64 = 0;

        loop {
            if stop.is_set() {
                return Ok(());
            }
            device.grab()?;
            counter += 1;
            if counter % frame_skip != 0 {
                continue;
            }

            let image = device.retrieve()?;
            let frame = Frame::new(self.camera, counter, image);
            self.bus.fan_out(&self.config.target_models, frame);

            if barrier.fire() {
                info!(camera = self.camera, "✅ 首帧已分发");
            }
        }
    }
}

/// 管理所有拉流线程
pub struct StreamManager {
    workers: Vec<WorkerHandle>,
}

impl StreamManager {
    /// 启动全部拉流线程, 阻塞直到每路都分发出首帧
    pub fn start(
        streams: &[StreamConfig],
        backend: Arc<dyn CaptureBackend>,
        bus: Arc<FrameBus>,
        runtime: &RuntimeConfig,
        cancel: &StopSignal,
    ) -> Result<Self> {
        let mut manager = Self {
            workers: Vec::with_capacity(streams.len()),
        };
        let mut waiters = Vec::with_capacity(streams.len());

        for (camera, config) in streams.iter().enumerate() {
            let (signal, waiter) = start_barrier();
            let worker = StreamWorker::new(
                camera,
                config.clone(),
                backend.clone(),
                bus.clone(),
                Backoff::new(runtime.reconnect_initial(), runtime.reconnect_max()),
            );
            match WorkerHandle::spawn(format!("stream-{camera}"), move |stop| {
                worker.run(signal, stop)
            }) {
                Ok(handle) => manager.workers.push(handle),
                Err(e) => {
                    manager.stop(runtime);
                    return Err(e);
                }
            }
            waiters.push(waiter);
        }

        // 拉流线程只会在停止时退出, 未就绪即视为超时
        if let Err((camera, outcome)) = wait_all(&waiters, runtime.start_timeout(), cancel) {
            manager.stop(runtime);
            if outcome == BarrierOutcome::Cancelled {
                info!(camera, "启动被取消");
                return Err(Error::StartCancelled);
            }
            warn!(camera, ?outcome, "❌ 视频流未能在超时内就绪");
            return Err(Error::StartTimeout {
                worker: format!("stream-{camera}"),
                secs: runtime.start_timeout().as_secs(),
            });
        }

        info!(streams = manager.workers.len(), "✅ 全部视频流就绪");
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// 先统一发出停止信号, 再逐个等待
    pub fn stop(self, runtime: &RuntimeConfig) {
        for worker in &self.workers {
            worker.signal_stop();
        }
        for worker in self.workers {
            worker.shutdown(runtime.stop_grace(), runtime.kill_grace());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ModelSlot;
    use crate::input::{SyntheticBackend, SyntheticSession};
    use crate::pipeline::bus::FrameQueue;
    use crate::pipeline::signal::{stop_signal, BarrierOutcome};
    use std::time::Instant;

    #[test]
    fn backoff_doubles_to_ceiling_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn frame_skip_decodes_every_nth_frame() {
        let backend = Arc::new(SyntheticBackend::new(
            [SyntheticSession::Frames(30)],
            SyntheticSession::Refused,
        ));
        let stats = backend.stats();
        let bus = Arc::new(FrameBus::new(2, 100));
        let config = StreamConfig::new("rtsp://cam", [1, 0]).with_frame_skip(5);
        let mut worker = StreamWorker::new(
            0,
            config,
            backend.clone(),
            bus.clone(),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        );

        let (mut barrier, waiter) = start_barrier();
        let (_trigger, stop) = stop_signal();
        let mut device = backend.open("rtsp://cam").unwrap();
        let result = worker.stream(device.as_mut(), &mut barrier, &stop);

        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(stats.grabs(), 30);
        assert_eq!(stats.decodes(), 6);
        assert_eq!(waiter.wait(Duration::ZERO), BarrierOutcome::Ready);
        for slot in [ModelSlot(0), ModelSlot(1)] {
            let q: &FrameQueue = bus.queue(slot).unwrap();
            let seqs: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|f| f.seq).collect();
            assert_eq!(seqs, vec![5, 10, 15, 20, 25, 30]);
        }
    }

    #[test]
    fn stop_during_backoff_exits_without_reconnecting() {
        let backend = Arc::new(SyntheticBackend::new([], SyntheticSession::Refused));
        let stats = backend.stats();
        let bus = Arc::new(FrameBus::new(1, 4));
        let worker = StreamWorker::new(
            0,
            StreamConfig::new("rtsp://down", [0]),
            backend,
            bus,
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        );
        let (barrier, waiter) = start_barrier();
        let handle = WorkerHandle::spawn("stream-test", move |stop| worker.run(barrier, stop))
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        let outcome = handle.shutdown(Duration::from_millis(500), Duration::from_millis(500));

        assert_eq!(outcome, crate::pipeline::worker::ShutdownOutcome::Clean);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(stats.opens(), 1);
        assert_eq!(waiter.wait(Duration::ZERO), BarrierOutcome::Abandoned);
    }

    #[test]
    fn reconnects_after_stream_drop() {
        let backend = Arc::new(SyntheticBackend::new(
            [SyntheticSession::Frames(3), SyntheticSession::Refused],
            SyntheticSession::Frames(u64::MAX),
        ));
        let stats = backend.stats();
        let bus = Arc::new(FrameBus::new(1, 4));
        let worker = StreamWorker::new(
            0,
            StreamConfig::new("rtsp://flaky", [0]).with_frame_skip(1),
            backend,
            bus.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        );
        let (barrier, _waiter) = start_barrier();
        let handle = WorkerHandle::spawn("stream-flaky", move |stop| worker.run(barrier, stop))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.opens() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown(Duration::from_secs(1), Duration::from_secs(1));
        assert!(stats.opens() >= 3);
        assert!(bus.queue(ModelSlot(0)).unwrap().len() <= 4);
    }
}
