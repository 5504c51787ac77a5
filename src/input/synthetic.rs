/// 合成采集后端
///
/// 每次 open 消耗一段脚本: 成功则返回固定帧数的设备, 帧耗尽后 grab 报错;
/// 失败则直接返回连接错误. 脚本用完后按 `fallback` 处理.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use super::{CaptureBackend, VideoCapture};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticSession {
    /// 打开成功, 提供 n 帧后断流
    Frames(u64),
    /// 打开失败
    Refused,
}

/// 调用计数, 供测试断言
#[derive(Debug, Default)]
pub struct SyntheticStats {
    pub opens: AtomicU64,
    pub grabs: AtomicU64,
    pub decodes: AtomicU64,
}

impl SyntheticStats {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn grabs(&self) -> u64 {
        self.grabs.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> u64 {
        self.decodes.load(Ordering::SeqCst)
    }
}

pub struct SyntheticBackend {
    script: Mutex<VecDeque<SyntheticSession>>,
    fallback: SyntheticSession,
    size: (u32, u32),
    frame_interval: Duration,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    pub fn new(
        script: impl IntoIterator<Item = SyntheticSession>,
        fallback: SyntheticSession,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            size: (64, 48),
            frame_interval: Duration::ZERO,
            stats: Arc::default(),
        }
    }

    /// 永不断流的摄像头
    pub fn endless() -> Self {
        Self::new([], SyntheticSession::Frames(u64::MAX))
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    /// 模拟帧率, 每次 grab 睡眠该间隔
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(&self, url: &str) -> Result<Box<dyn VideoCapture>> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let session = self.script.lock().pop_front().unwrap_or(self.fallback);
        match session {
            SyntheticSession::Frames(total) => Ok(Box::new(SyntheticCapture {
                url: url.to_string(),
                total,
                grabbed: 0,
                size: self.size,
                frame_interval: self.frame_interval,
                stats: self.stats.clone(),
            })),
            SyntheticSession::Refused => Err(Error::connection(url, "connection refused")),
        }
    }
}

pub struct SyntheticCapture {
    url: String,
    total: u64,
    grabbed: u64,
    size: (u32, u32),
    frame_interval: Duration,
    stats: Arc<SyntheticStats>,
}

impl VideoCapture for SyntheticCapture {
    fn grab(&mut self) -> Result<()> {
        if self.grabbed >= self.total {
            return Err(Error::connection(&self.url, "end of stream"));
        }
        if !self.frame_interval.is_zero() {
            std::thread::sleep(self.frame_interval);
        }
        self.grabbed += 1;
        self.stats.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        if self.grabbed == 0 {
            return Err(Error::connection(&self.url, "retrieve before grab"));
        }
        self.stats.decodes.fetch_add(1, Ordering::SeqCst);
        // 帧序号编码进第一个像素, 便于测试核对
        let (w, h) = self.size;
        let mut img = RgbImage::from_pixel(w, h, Rgb([32, 32, 32]));
        let seq = self.grabbed;
        img.put_pixel(0, 0, Rgb([(seq & 0xff) as u8, ((seq >> 8) & 0xff) as u8, 0]));
        Ok(img)
    }
}
