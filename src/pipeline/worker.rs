/// 工作线程句柄
///
/// 每个拉流/推理任务独占一个具名线程. 关停分三级:
/// 1. 触发停止信号, 等待 grace
/// 2. 仍未退出则告警, 再等待 kill_grace
/// 3. 放弃该线程 (detach) 并记录错误, 关停流程本身永不失败
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, warn};

use super::signal::{stop_signal, StopSignal, StopTrigger};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// grace 内正常退出
    Clean,
    /// 第二级等待内退出
    Late,
    /// 线程未响应, 已放弃
    Abandoned,
}

pub struct WorkerHandle {
    name: String,
    stop: StopTrigger,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// 在具名线程上运行 `body`, 线程退出 (含 panic) 时 done 通道断开
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let (stop, signal) = stop_signal();
        let (done_tx, done) = bounded::<()>(0);

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = done_tx;
                body(signal);
            })
            .map_err(|source| Error::WorkerSpawn {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            stop,
            done,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 第一级: 协作式停止
    pub fn signal_stop(&self) {
        self.stop.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// 等待线程退出, 超时逐级升级
    pub fn shutdown(mut self, grace: Duration, kill_grace: Duration) -> ShutdownOutcome {
        self.signal_stop();

        let outcome = if self.wait_done(grace) {
            ShutdownOutcome::Clean
        } else {
            warn!(worker = %self.name, grace_ms = grace.as_millis() as u64, "⚠️ 工作线程未在宽限期内退出, 继续等待");
            if self.wait_done(kill_grace) {
                ShutdownOutcome::Late
            } else {
                ShutdownOutcome::Abandoned
            }
        };

        match outcome {
            ShutdownOutcome::Abandoned => {
                error!(worker = %self.name, "❌ 工作线程无响应, 已放弃");
                // 丢弃 JoinHandle 即 detach
                self.join.take();
            }
            _ => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        error!(worker = %self.name, "❌ 工作线程 panic 退出");
                    }
                }
                debug!(worker = %self.name, ?outcome, "工作线程已退出");
            }
        }
        outcome
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected) | Ok(())
        )
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn cooperative_worker_stops_cleanly() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let handle = WorkerHandle::spawn("test-coop", move |stop| {
            while !stop.sleep(Duration::from_secs(10)) {}
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(handle.name(), "test-coop");
        let outcome = handle.shutdown(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(outcome, ShutdownOutcome::Clean);
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn stuck_worker_is_abandoned() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let handle = WorkerHandle::spawn("test-stuck", move |_stop| {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        let outcome = handle.shutdown(Duration::from_millis(20), Duration::from_millis(20));
        assert_eq!(outcome, ShutdownOutcome::Abandoned);
        drop(release_tx);
    }

    #[test]
    fn panicking_worker_counts_as_exited() {
        let handle = WorkerHandle::spawn("test-panic", |_stop| panic!("boom")).unwrap();
        let outcome = handle.shutdown(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(outcome, ShutdownOutcome::Clean);
    }
}
