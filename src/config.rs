//! 分析参数配置 - 通过JSON文件调整参数
//! Analyzer configuration, persisted as pretty JSON.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AnalysisError, PipelineResult};
use crate::video::Codec;

/// 推理设备
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CUDA when compiled in and available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// 检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub confidence_threshold: f32, // 检测置信度阈值
    pub nms_iou_threshold: f32,    // 检测器内部 NMS IOU阈值
    pub input_size: u32,           // 模型输入尺寸 (正方形)
    pub device: Device,
    /// Overrides the class names embedded in the model metadata.
    pub class_names: Option<Vec<String>>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            nms_iou_threshold: 0.45,
            input_size: 640,
            device: Device::Auto,
            class_names: None,
        }
    }
}

/// ByteTrack参数 (每队一个跟踪器)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_lost_frames: u32,      // 最大丢失帧数
    pub high_score_threshold: f32, // 高分阈值
    pub low_score_threshold: f32,  // 低分阈值
    pub high_iou_threshold: f32,   // 高分IOU阈值
    pub low_iou_threshold: f32,    // 低分IOU阈值
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_lost_frames: 30,
            high_score_threshold: 0.25,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.3,
            low_iou_threshold: 0.2,
        }
    }
}

/// 球队颜色聚类参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    /// HSV fallback prototypes (OpenCV 8-bit ranges)
    pub default_colors: [[f32; 3]; 2],
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            n_init: 10,
            max_iter: 100,
            default_colors: [[100.0, 255.0, 255.0], [0.0, 255.0, 255.0]],
        }
    }
}

/// 控球判定参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PossessionConfig {
    /// Max distance in pixels from the ball centre to a player's foot
    pub max_ball_distance: f32,
    pub highlight_padding: f32,
    pub ball_padding: f32,
}

impl Default for PossessionConfig {
    fn default() -> Self {
        Self {
            max_ball_distance: 70.0,
            highlight_padding: 10.0,
            ball_padding: 10.0,
        }
    }
}

/// 标注参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub show_heatmap: bool,
    pub heatmap_history: usize, // 每队保留的最近位置数
    pub heatmap_opacity: f32,
    pub font_path: Option<String>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            show_heatmap: false,
            heatmap_history: 200,
            heatmap_opacity: 0.4,
            font_path: None,
        }
    }
}

/// 输出参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Codec/container pairs, tried in order
    pub codecs: Vec<Codec>,
    /// Frames between progress events; `None` means once per second of video
    pub progress_interval: Option<u64>,
    /// Depth of the writer thread queue; 0 writes inline
    pub writer_queue: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            codecs: Codec::preference_list(),
            progress_interval: None,
            writer_queue: 8,
        }
    }
}

/// 分析器完整配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub detector: DetectorConfig,
    /// NMS IOU threshold applied to player boxes after detection
    pub player_nms_iou: f32,
    pub tracker: TrackerConfig,
    pub team: TeamConfig,
    pub possession: PossessionConfig,
    pub annotation: AnnotationConfig,
    pub output: OutputConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            player_nms_iou: 0.5,
            tracker: TrackerConfig::default(),
            team: TeamConfig::default(),
            possession: PossessionConfig::default(),
            annotation: AnnotationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl AnalyzerConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            AnalysisError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise write the defaults there.
    pub fn load_or_create(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        warn!(path = %path.display(), "configuration file missing, writing defaults");
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AnalysisError::config(format!("failed to serialise config: {}", e)))?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let unit = [
            ("detector.confidence_threshold", self.detector.confidence_threshold),
            ("detector.nms_iou_threshold", self.detector.nms_iou_threshold),
            ("player_nms_iou", self.player_nms_iou),
            ("tracker.high_score_threshold", self.tracker.high_score_threshold),
            ("tracker.low_score_threshold", self.tracker.low_score_threshold),
            ("tracker.high_iou_threshold", self.tracker.high_iou_threshold),
            ("tracker.low_iou_threshold", self.tracker.low_iou_threshold),
            ("annotation.heatmap_opacity", self.annotation.heatmap_opacity),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.tracker.low_score_threshold > self.tracker.high_score_threshold {
            return Err(AnalysisError::config(
                "tracker.low_score_threshold exceeds tracker.high_score_threshold",
            ));
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(AnalysisError::config(format!(
                "detector.input_size must be a positive multiple of 32, got {}",
                self.detector.input_size
            )));
        }
        if self.team.n_init == 0 || self.team.max_iter == 0 {
            return Err(AnalysisError::config("team.n_init and team.max_iter must be positive"));
        }
        if self.possession.max_ball_distance.is_nan() || self.possession.max_ball_distance <= 0.0 {
            return Err(AnalysisError::config("possession.max_ball_distance must be positive"));
        }
        if self.annotation.heatmap_history == 0 {
            return Err(AnalysisError::config("annotation.heatmap_history must be positive"));
        }
        if self.output.codecs.is_empty() {
            return Err(AnalysisError::config("output.codecs must not be empty"));
        }
        if self.output.progress_interval == Some(0) {
            return Err(AnalysisError::config("output.progress_interval must be positive"));
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            confidence = self.detector.confidence_threshold,
            input_size = self.detector.input_size,
            device = ?self.detector.device,
            max_lost_frames = self.tracker.max_lost_frames,
            max_ball_distance = self.possession.max_ball_distance,
            heatmap = self.annotation.show_heatmap,
            codecs = self.output.codecs.len(),
            "analyzer configuration"
        );
    }
}
