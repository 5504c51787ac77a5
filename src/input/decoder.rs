/// RTSP主动拉流解码器
/// RTSP active pulling decoder with software decoding only
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;
use tracing::{info, warn};

use super::decode_filter::{DecodeFilter, YuvFrame};
use super::{CaptureBackend, VideoCapture};
use crate::{Error, Result};

/// 解码线程与采集端之间的缓冲帧数
const FRAME_BUFFER: usize = 8;

/// ez-ffmpeg 采集后端
pub struct FfmpegBackend {
    open_timeout: Duration,
    read_timeout: Duration,
}

impl FfmpegBackend {
    pub fn new(open_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            open_timeout,
            read_timeout,
        }
    }
}

impl CaptureBackend for FfmpegBackend {
    fn open(&self, url: &str) -> Result<Box<dyn VideoCapture>> {
        let (tx, rx) = bounded(FRAME_BUFFER);
        let (status_tx, status_rx) = bounded(1);

        let rtsp_url = url.to_string();
        std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || software_decode(rtsp_url, tx, status_tx))?;

        match status_rx.recv_timeout(self.open_timeout) {
            Ok(Ok(())) => Ok(Box::new(FfmpegCapture {
                url: url.to_string(),
                rx,
                current: None,
                read_timeout: self.read_timeout,
            })),
            Ok(Err(reason)) => Err(Error::connection(url, reason)),
            Err(_) => Err(Error::connection(url, "timed out opening stream")),
        }
    }
}

/// CPU软件解码, 阻塞直到流结束或采集端释放
fn software_decode(
    rtsp_url: String,
    tx: Sender<YuvFrame>,
    status: Sender<std::result::Result<(), String>>,
) {
    let filter = DecodeFilter::new(rtsp_url.clone(), tx);
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let input = Input::new(rtsp_url.as_str()).set_input_opts(
        [
            ("rtsp_transport", "tcp"),
            ("buffer_size", "67108864"),
            ("rtsp_flags", "prefer_tcp"),
            ("timeout", "5000000"),
        ]
        .into(),
    );

    let started = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
        .map_err(|e| format!("构建失败: {}", e))
        .and_then(|ctx| ctx.start().map_err(|e| format!("启动失败: {}", e)));

    match started {
        Ok(sch) => {
            info!(url = %rtsp_url, "✅ CPU软件解码启动成功");
            let _ = status.send(Ok(()));
            if let Err(e) = sch.wait() {
                warn!(url = %rtsp_url, "解码任务结束: {}", e);
            }
        }
        Err(e) => {
            let _ = status.send(Err(e));
        }
    }
}

/// 已打开的 RTSP 流
pub struct FfmpegCapture {
    url: String,
    rx: Receiver<YuvFrame>,
    current: Option<YuvFrame>,
    read_timeout: Duration,
}

impl VideoCapture for FfmpegCapture {
    fn grab(&mut self) -> Result<()> {
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(frame) => {
                self.current = Some(frame);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::connection(&self.url, "read timeout")),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::connection(&self.url, "stream closed"))
            }
        }
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        self.current
            .as_ref()
            .map(YuvFrame::to_rgb)
            .ok_or_else(|| Error::connection(&self.url, "retrieve before grab"))
    }
}
