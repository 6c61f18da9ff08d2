// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 帧标注 (标记、标签、控球比分、热力图)
pub mod config; // 分析参数配置
pub mod detection; // 检测与按队跟踪
pub mod error; // 错误类型
pub mod job; // 分析任务接口
pub mod pipeline; // 视频分析流水线
pub mod possession; // 控球判定
pub mod team; // 球队颜色聚类
pub mod video; // 视频读写

pub use crate::config::{AnalyzerConfig, Device};
pub use crate::detection::{
    BBox, ByteTracker, ClassId, Detection, DetectionSet, Detector, OnnxDetector,
};
pub use crate::error::{AnalysisError, ErrorKind, FrameStage, PipelineResult, VideoError};
pub use crate::job::{run_job, spawn_job, JobHandle, JobRequest};
pub use crate::pipeline::{
    AnalysisResult, AnalysisStats, CancelToken, JobState, JobUpdate, OutputPaths,
    PipelineState, ProgressReporter, VideoAnalyzer,
};
pub use crate::possession::{PossessionLedger, PossessionResolver};
pub use crate::team::{Team, TeamAssigner};
pub use crate::video::{Codec, FrameSink, FrameSource, VideoBackend, VideoInfo};
