/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
///
/// 只拷贝 YUV420P 平面, RGB 转换推迟到 retrieve, 跳过的帧不付出转换开销
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use image::RgbImage;
use tracing::{debug, info, warn};

/// 一帧 YUV420P 原始数据 (解码线程 → 拉流线程)
pub struct YuvFrame {
    pub width: u32,
    pub height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    y_stride: usize,
    uv_stride: usize,
}

impl YuvFrame {
    /// BT.601 整数近似转换
    pub fn to_rgb(&self) -> RgbImage {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut buffer = vec![0u8; w * h * 3];
        let mut out_idx = 0;
        for y in 0..h {
            let y_row = y * self.y_stride;
            let uv_row = (y >> 1) * self.uv_stride;
            for x in 0..w {
                let y_val = self.y[y_row + x] as i32;
                let u_val = self.u[uv_row + (x >> 1)] as i32 - 128;
                let v_val = self.v[uv_row + (x >> 1)] as i32 - 128;

                buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
                buffer[out_idx + 1] =
                    (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
                buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
                out_idx += 3;
            }
        }
        RgbImage::from_raw(self.width, self.height, buffer)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

/// FFmpeg解码过滤器: RTSP流 → YUV平面 → 通道
pub struct DecodeFilter {
    url: String,
    tx: Sender<YuvFrame>,
    count: usize,
    last: Instant,
    dropped_frames: usize,
    total_frames: usize,
}

impl DecodeFilter {
    pub fn new(url: impl Into<String>, tx: Sender<YuvFrame>) -> Self {
        Self {
            url: url.into(),
            tx,
            count: 0,
            last: Instant::now(),
            dropped_frames: 0,
            total_frames: 0,
        }
    }

    fn drop_frame(&mut self, reason: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            warn!(url = %self.url, frame = self.total_frames, "⚠️ 丢弃帧: {reason}");
        }
        Ok(None)
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!(url = %self.url, "✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        self.total_frames += 1;

        let yuv = unsafe {
            // 基本检查：空帧或损坏帧
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.drop_frame("空帧/损坏帧");
            }

            let raw = &*frame.as_ptr();
            let w = raw.width as u32;
            let h = raw.height as u32;
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                return self.drop_frame("非法分辨率");
            }

            // 只丢弃严重错误的帧 (缺少参考帧、无效比特流)
            if raw.decode_error_flags & 0x03 != 0 {
                return self.drop_frame("解码错误标志");
            }

            let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                return self.drop_frame("YUV指针为空");
            }
            if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
                return self.drop_frame("步长异常");
            }

            let uv_rows = (h as usize).div_ceil(2);
            YuvFrame {
                width: w,
                height: h,
                y: std::slice::from_raw_parts(y_plane, y_stride * h as usize).to_vec(),
                u: std::slice::from_raw_parts(u_plane, uv_stride * uv_rows).to_vec(),
                v: std::slice::from_raw_parts(v_plane, uv_stride * uv_rows).to_vec(),
                y_stride,
                uv_stride,
            }
        };

        match self.tx.try_send(yuv) {
            Ok(()) => self.count += 1,
            Err(TrySendError::Full(_)) => self.dropped_frames += 1,
            // 采集端已释放, 终止本次 ffmpeg 任务
            Err(TrySendError::Disconnected(_)) => return Err("capture closed".to_string()),
        }

        if self.last.elapsed().as_secs_f64() >= 10.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            debug!(
                url = %self.url,
                fps = format_args!("{:.1}", self.count as f64 / elapsed),
                total = self.total_frames,
                dropped = self.dropped_frames,
                "📺 解码统计"
            );
            self.last = Instant::now();
            self.count = 0;
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(url = %self.url, "解码线程退出");
    }
}
