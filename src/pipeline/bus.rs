/// 帧分发总线 (Frame Distribution Bus)
///
/// 每个模型槽位一个有界 FIFO 队列. 入队永不阻塞: 队列满时丢弃最旧的帧,
/// 保证拉流线程不会被慢速推理拖住.
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::trace;

use super::signal::StopSignal;
use crate::detection::{Frame, ModelSlot};

pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        // bounded(0) 是同步通道, 至少保留一个槽位
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// 非阻塞入队, 满则先弹出最旧帧; 返回被挤掉的帧数
    pub fn push(&self, frame: Frame) -> usize {
        let mut frame = frame;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(f)) => {
                    frame = f;
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // 本结构同时持有收发两端, 不会断开
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// 阻塞出队, 收到停止信号返回 None
    pub fn pop(&self, stop: &StopSignal) -> Option<Frame> {
        if stop.is_set() {
            return None;
        }
        select! {
            recv(self.rx) -> frame => frame.ok(),
            recv(stop.receiver()) -> _ => None,
        }
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 累计丢弃帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct FrameBus {
    queues: Vec<FrameQueue>,
}

impl FrameBus {
    pub fn new(models: usize, queue_size: usize) -> Self {
        Self {
            queues: (0..models).map(|_| FrameQueue::new(queue_size)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queue(&self, slot: ModelSlot) -> Option<&FrameQueue> {
        self.queues.get(slot.index())
    }

    pub fn enqueue(&self, slot: ModelSlot, frame: Frame) {
        match self.queues.get(slot.index()) {
            Some(queue) => {
                if queue.push(frame) > 0 {
                    trace!(%slot, "queue full, dropped oldest frame");
                }
            }
            None => debug_assert!(false, "enqueue to unknown slot {slot}"),
        }
    }

    pub fn dequeue(&self, slot: ModelSlot, stop: &StopSignal) -> Option<Frame> {
        self.queues.get(slot.index())?.pop(stop)
    }

    /// 按槽位升序分发同一帧 (共享 Arc 图像)
    pub fn fan_out<'a>(&self, targets: impl IntoIterator<Item = &'a usize>, frame: Frame) {
        for &target in targets {
            self.enqueue(ModelSlot(target), frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::signal::stop_signal;
    use image::RgbImage;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::new(0, seq, RgbImage::new(2, 2))
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_newest() {
        let q = FrameQueue::new(3);
        for seq in 1..=10 {
            q.push(frame(seq));
            assert!(q.len() <= 3);
        }
        assert_eq!(q.dropped(), 7);
        let seqs: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|f| f.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = FrameQueue::new(0);
        q.push(frame(1));
        q.push(frame(2));
        assert_eq!(q.capacity(), 1);
        assert_eq!(q.try_pop().map(|f| f.seq), Some(2));
    }

    #[test]
    fn fan_out_reaches_every_target() {
        let bus = FrameBus::new(3, 4);
        let targets: BTreeSet<usize> = [2, 0].into_iter().collect();
        bus.fan_out(&targets, frame(7));
        assert_eq!(bus.queue(ModelSlot(0)).map(FrameQueue::len), Some(1));
        assert_eq!(bus.queue(ModelSlot(1)).map(FrameQueue::len), Some(0));
        assert_eq!(bus.queue(ModelSlot(2)).map(FrameQueue::len), Some(1));
    }

    #[test]
    fn dequeue_unblocks_on_stop() {
        let bus = std::sync::Arc::new(FrameBus::new(1, 4));
        let (trigger, signal) = stop_signal();
        let b = bus.clone();
        let t = std::thread::spawn(move || b.dequeue(ModelSlot(0), &signal));
        std::thread::sleep(Duration::from_millis(20));
        trigger.trigger();
        assert!(t.join().unwrap().is_none());
    }

    #[test]
    fn dequeue_returns_frames_in_order() {
        let bus = FrameBus::new(1, 4);
        let (_trigger, signal) = stop_signal();
        bus.enqueue(ModelSlot(0), frame(1));
        bus.enqueue(ModelSlot(0), frame(2));
        assert_eq!(bus.dequeue(ModelSlot(0), &signal).map(|f| f.seq), Some(1));
        assert_eq!(bus.dequeue(ModelSlot(0), &signal).map(|f| f.seq), Some(2));
    }
}
