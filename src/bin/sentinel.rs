/// 实训考核监测服务 (Exam Sentinel)
///
/// 系统架构:
/// 1. 拉流线程: 每路摄像头一个, RTSP 解码后按目标模型分发
/// 2. 推理线程: 每个模型槽位一个, 出队 → 推理 → 规则判定 → 截图
/// 3. 主线程:   读取标准输入的控制命令, 以 JSON 输出应答
///
/// 运行: cargo run --bin sentinel --release --features ffmpeg,onnx -- -c sentinel.toml
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exam_sentinel::input::FfmpegBackend;
use exam_sentinel::models::OnnxLoader;
use exam_sentinel::{report, DetectionManager, ServerConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "实训考核视觉监测服务", long_about = None)]
struct Args {
    /// 配置文件 (TOML)
    #[arg(short, long, default_value = "sentinel.toml")]
    config: PathBuf,

    /// 日志过滤, 缺省读取 RUST_LOG, 再缺省为 info
    #[arg(long)]
    log: Option<String>,

    /// 启动后不自动开始检测
    #[arg(long)]
    no_autostart: bool,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => error!("❌ 应答序列化失败: {e}"),
    }
}

fn start(manager: &DetectionManager) {
    match report::start_detection(manager) {
        Ok(reply) => print_json(&reply),
        Err(e) => {
            error!("❌ 检测服务启动失败: {e}");
            print_json(&serde_json::json!({ "status": "FAILURE", "detail": e.to_string() }));
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let config = ServerConfig::from_file(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    info!("🚀 考核监测服务启动");
    info!("📋 服务类型: {}", config.service);
    for (i, model) in config.models.iter().enumerate() {
        info!("📦 模型 m{i}: {} ({:?})", model.weights.display(), model.task);
    }
    for stream in &config.streams {
        info!("📹 RTSP地址: {} → {:?}", stream.rtsp_url, stream.target_models);
    }

    let backend = FfmpegBackend::new(config.runtime.start_timeout(), config.runtime.read_timeout());
    let manager = DetectionManager::new(config, Arc::new(backend), Arc::new(OnnxLoader))?;

    if !args.no_autostart {
        start(&manager);
    }

    info!(
        "✅ 等待命令: start | stop | exam-start | exam-stop | reset | status | \
         wearing-start | wearing-end | position | wearing | quit"
    );
    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" => continue,
            "start" => start(&manager),
            "stop" => print_json(&report::stop_detection(&manager)),
            "exam-start" => print_json(&report::start_exam(&manager)),
            "exam-stop" => print_json(&report::stop_exam(&manager)),
            "reset" => print_json(&report::reset_status(&manager)),
            "status" => print_json(&report::exam_status(&manager)),
            "wearing-start" => match report::wearing_detection(&manager) {
                Ok(reply) => print_json(&reply),
                Err(e) => error!("❌ 穿戴检查启动失败: {e}"),
            },
            "wearing-end" => print_json(&report::end_wearing_exam(&manager)),
            "position" => print_json(&report::human_position_status(&manager)),
            "wearing" => print_json(&report::wearing_status(&manager)),
            "quit" | "exit" => break,
            other => warn!("未知命令: {other}"),
        }
    }

    report::stop_detection(&manager);
    info!("👋 服务已退出");
    Ok(())
}
