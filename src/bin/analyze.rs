//! 足球比赛视频分析
//!
//! 直接运行: cargo run --release --features opencv --bin analyze -- --input match.mp4

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use football_analyzer::config::Device;
use football_analyzer::job::{load_onnx_detector, run_job, JobRequest};
use football_analyzer::pipeline::{CancelToken, LogReporter};
use football_analyzer::video::OpenCvBackend;
use football_analyzer::AnalyzerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "足球比赛视频分析: 检测、分队、跟踪、控球统计", long_about = None)]
struct Args {
    /// 输入视频
    #[arg(short, long)]
    input: PathBuf,

    /// 检测模型 (YOLOv8 ONNX)
    #[arg(short, long, default_value = "models/best.onnx")]
    model: PathBuf,

    /// 结果目录
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    /// 任务名, 输出为 {job}_processed.mp4 / {job}_stats.json
    #[arg(short, long)]
    job: Option<String>,

    /// JSON配置文件, 不存在时写入默认配置
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 叠加球员位置热力图
    #[arg(long)]
    heatmap: bool,

    /// 检测置信度阈值
    #[arg(long)]
    conf: Option<f32>,

    /// 推理设备: auto / cpu / cuda
    #[arg(long, value_parser = parse_device)]
    device: Option<Device>,
}

fn parse_device(s: &str) -> Result<Device, String> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(Device::Auto),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda),
        other => Err(format!("unknown device '{}'", other)),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ort=warn")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AnalyzerConfig::load_or_create(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalyzerConfig::default(),
    };
    if args.heatmap {
        config.annotation.show_heatmap = true;
    }
    if let Some(conf) = args.conf {
        config.detector.confidence_threshold = conf;
    }
    if let Some(device) = args.device {
        config.detector.device = device;
    }
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let job_id = match args.job {
        Some(job) => job,
        None => args
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("input path has no file name")?,
    };
    let request = JobRequest::new(&args.input, &args.model, &args.output_dir, &job_id)
        .with_config(config);

    let result = run_job(
        &request,
        &OpenCvBackend::new(),
        &LogReporter,
        &CancelToken::new(),
        load_onnx_detector,
    )
    .with_context(|| format!("analysis of {} failed", args.input.display()))?;

    info!(
        video = %result.video_path.display(),
        stats = %result.stats_path.display(),
        team1 = result.stats.ball_possession_percent.team1,
        team2 = result.stats.ball_possession_percent.team2,
        "🏁 完成"
    );
    Ok(())
}
