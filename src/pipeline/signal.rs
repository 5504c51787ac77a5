/// 停止信号与启动屏障
///
/// 两者都基于 crossbeam 通道的断开语义: 发送端被丢弃即视为触发,
/// 因此等待方可以和帧队列一起放进 `select!`.
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// 创建一对停止信号 (触发端, 观察端)
pub fn stop_signal() -> (StopTrigger, StopSignal) {
    let (tx, rx) = bounded::<()>(0);
    (
        StopTrigger {
            tx: Mutex::new(Some(tx)),
        },
        StopSignal { rx },
    )
}

/// 停止信号触发端, 由管理器持有
pub struct StopTrigger {
    tx: Mutex<Option<Sender<()>>>,
}

impl StopTrigger {
    pub fn trigger(&self) {
        self.tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// 停止信号观察端, 由工作线程持有
#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_set(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// 可被打断的睡眠, 返回 true 表示期间收到了停止信号
    pub fn sleep(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// 创建一次性启动屏障 (工作线程端, 管理器端)
pub fn start_barrier() -> (BarrierSignal, BarrierWaiter) {
    let (tx, rx) = bounded::<()>(1);
    (BarrierSignal { tx: Some(tx) }, BarrierWaiter { rx })
}

/// 工作线程就绪后触发, 整个生命周期只生效一次
pub struct BarrierSignal {
    tx: Option<Sender<()>>,
}

impl BarrierSignal {
    /// 首次调用返回 true
    pub fn fire(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    Ready,
    /// 工作线程未触发屏障就退出了
    Abandoned,
    TimedOut,
    /// 等待期间收到停止请求
    Cancelled,
}

pub struct BarrierWaiter {
    rx: Receiver<()>,
}

impl BarrierWaiter {
    pub fn wait(&self, timeout: Duration) -> BarrierOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => BarrierOutcome::Ready,
            Err(RecvTimeoutError::Disconnected) => BarrierOutcome::Abandoned,
            Err(RecvTimeoutError::Timeout) => BarrierOutcome::TimedOut,
        }
    }

    /// 同 `wait`, 但 `cancel` 触发时立即返回
    pub fn wait_or_cancel(&self, timeout: Duration, cancel: &StopSignal) -> BarrierOutcome {
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(()) => BarrierOutcome::Ready,
                Err(_) => BarrierOutcome::Abandoned,
            },
            recv(cancel.receiver()) -> _ => BarrierOutcome::Cancelled,
            default(timeout) => BarrierOutcome::TimedOut,
        }
    }
}

/// 在同一截止时间内等待全部屏障, 失败时返回首个未就绪的下标
pub fn wait_all(
    waiters: &[BarrierWaiter],
    timeout: Duration,
    cancel: &StopSignal,
) -> std::result::Result<(), (usize, BarrierOutcome)> {
    let deadline = Instant::now() + timeout;
    for (i, waiter) in waiters.iter().enumerate() {
        if cancel.is_set() {
            return Err((i, BarrierOutcome::Cancelled));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match waiter.wait_or_cancel(remaining, cancel) {
            BarrierOutcome::Ready => {}
            outcome => return Err((i, outcome)),
        }
    }
    Ok(())
}
