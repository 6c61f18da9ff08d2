/// 视频分析流水线 (Video Analysis Pipeline)
///
/// 单线程逐帧处理, 写帧可交给独立线程:
/// - VideoAnalyzer:  INIT → VALIDATING → STREAMING → FINALIZING → DONE/FAILED
/// - FrameProcessor: 检测 → 分队 → 跟踪 → 控球判定 → 标注
/// - progress:       任务进度上报
/// - stats:          统计结果
pub mod progress;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::annotate::{FrameAnnotator, FrameDetections, Labels};
use crate::config::AnalyzerConfig;
use crate::detection::{validate_detector, ByteTracker, ClassId, DetectionSet, Detector, Tracker};
use crate::error::{AnalysisError, FrameStage, InputKind, PipelineResult};
use crate::possession::{FrameOutcome, PossessionLedger, PossessionResolver};
use crate::team::{Team, TeamAssigner};
use crate::video::{
    open_sink_with_fallback, FrameSource, OpenedSink, OutputGuard, ThreadedSink, VideoBackend,
    VideoInfo,
};

pub use progress::{
    ChannelReporter, JobMeta, JobState, JobUpdate, LogReporter, NoopReporter, ProgressClock,
    ProgressMeta, ProgressReporter,
};
pub use stats::{AnalysisResult, AnalysisStats, TeamPair};

/// 流水线状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Validating,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

/// Cooperative cancellation, checked between frames.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the annotated video and the statistics file go. The video
/// extension may change to match the codec that opens.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputPaths {
    pub video: PathBuf,
    pub stats: PathBuf,
}

// ========== 单帧处理 ==========

/// Per-run state of the frame step. Everything in here is private to one
/// video and is dropped with it.
pub struct FrameProcessor {
    player_nms_iou: f32,
    ball_padding: f32,
    assigner: TeamAssigner,
    trackers: [ByteTracker; 2],
    resolver: PossessionResolver,
    annotator: FrameAnnotator,
}

impl FrameProcessor {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self::with_annotator(config, FrameAnnotator::new(&config.annotation))
    }

    pub fn with_annotator(config: &AnalyzerConfig, annotator: FrameAnnotator) -> Self {
        Self {
            player_nms_iou: config.player_nms_iou,
            ball_padding: config.possession.ball_padding,
            assigner: TeamAssigner::new(config.team.clone()),
            trackers: [
                ByteTracker::new(&config.tracker),
                ByteTracker::new(&config.tracker),
            ],
            resolver: PossessionResolver::new(config.possession.clone()),
            annotator,
        }
    }

    pub fn ledger(&self) -> &PossessionLedger {
        self.resolver.ledger()
    }

    pub fn assigner(&self) -> &TeamAssigner {
        &self.assigner
    }

    /// Run one frame through detection, team split, tracking, possession
    /// and annotation. `frame` is annotated in place.
    pub fn process(
        &mut self,
        index: u64,
        frame: &mut RgbImage,
        detector: &mut dyn Detector,
    ) -> PipelineResult<FrameOutcome> {
        let detections = detector
            .detect(frame)
            .map_err(|e| AnalysisError::frame(index, FrameStage::Detect, e))?;

        let balls = detections.filter_class(ClassId::Ball);
        let goalkeepers = detections.filter_class(ClassId::Goalkeeper);
        let referees = detections.filter_class(ClassId::Referee);
        let players = detections
            .filter_class(ClassId::Player)
            .with_nms(self.player_nms_iou);

        // 首个有球员的帧拟合球队颜色
        if !self.assigner.is_fitted() && !players.is_empty() {
            self.assigner.fit(frame, &players);
        }
        let (team1, team2) = if self.assigner.is_fitted() {
            self.assigner.partition(frame, &players)
        } else {
            (DetectionSet::empty(), DetectionSet::empty())
        };

        let team1 = self.trackers[Team::One.index()].update(&team1);
        let team2 = self.trackers[Team::Two.index()].update(&team2);
        let tracked = DetectionSet::merge(&[&team1, &team2])
            .map_err(|e| AnalysisError::frame(index, FrameStage::Track, e))?;

        let outcome = self.resolver.resolve(&tracked, &balls);
        debug!(
            frame = index,
            players = players.len(),
            balls = balls.len(),
            team = ?outcome.team.map(Team::key),
            source = ?outcome.source,
            "frame processed"
        );

        let frame_detections = FrameDetections {
            team1,
            team2,
            referees,
            goalkeepers,
            ball: balls.padded(self.ball_padding),
            active_player: outcome.active_player.iter().cloned().collect(),
        };
        let labels = Labels::for_frame(&frame_detections);
        self.annotator
            .annotate(frame, &frame_detections, &labels, self.resolver.ledger());

        Ok(outcome)
    }
}

// ========== 编排器 ==========

/// 视频分析器
pub struct VideoAnalyzer {
    detector: Box<dyn Detector>,
    config: AnalyzerConfig,
    state: PipelineState,
}

impl VideoAnalyzer {
    /// Validate the configuration and the detector's class names. Nothing
    /// is read from the video yet.
    pub fn new(detector: Box<dyn Detector>, config: AnalyzerConfig) -> PipelineResult<Self> {
        config.validate()?;
        validate_detector(detector.as_ref())?;
        Ok(Self {
            detector,
            config,
            state: PipelineState::Init,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyse `input` end to end. The output sink is released on every
    /// path; on failure the partial video is removed.
    pub fn analyze(
        &mut self,
        backend: &dyn VideoBackend,
        input: &Path,
        output: &OutputPaths,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> PipelineResult<AnalysisResult> {
        let processor = FrameProcessor::new(&self.config);
        self.analyze_with(backend, input, output, reporter, cancel, processor)
    }

    /// Like [`analyze`](Self::analyze) with a caller-built frame processor.
    pub fn analyze_with(
        &mut self,
        backend: &dyn VideoBackend,
        input: &Path,
        output: &OutputPaths,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
        processor: FrameProcessor,
    ) -> PipelineResult<AnalysisResult> {
        let result = self.run(backend, input, output, reporter, cancel, processor);
        match &result {
            Ok(r) => {
                self.state = PipelineState::Done;
                info!(
                    video = %r.video_path.display(),
                    frames = r.stats.frames_processed,
                    team1 = r.stats.ball_possession_percent.team1,
                    team2 = r.stats.ball_possession_percent.team2,
                    "✅ 分析完成"
                );
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                error!(kind = e.kind().as_str(), error = %e, "❌ 分析失败");
            }
        }
        result
    }

    fn run(
        &mut self,
        backend: &dyn VideoBackend,
        input: &Path,
        output: &OutputPaths,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
        mut processor: FrameProcessor,
    ) -> PipelineResult<AnalysisResult> {
        // ===== VALIDATING =====
        self.state = PipelineState::Validating;
        let (mut source, first) = open_input(backend, input)?;
        // 输出尺寸以解码帧为准
        let mut info = source.info().clone();
        (info.width, info.height) = first.dimensions();

        // ===== STREAMING =====
        self.state = PipelineState::Streaming;
        let mut guard = self.open_output(backend, &output.video, &info)?;
        let interval = self.progress_interval(info.fps);
        let clock = ProgressClock::start(info.frame_count);
        info!(
            input = %input.display(),
            output = %guard.path().display(),
            codec = %guard.codec(),
            frames = info.frame_count,
            progress_every = interval,
            "🎬 开始分析"
        );

        let mut next = Some(first);
        let mut index = 0u64;
        while let Some(mut frame) = next.take() {
            index += 1;
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled { frame: index });
            }

            processor.process(index, &mut frame, self.detector.as_mut())?;
            guard
                .write(&frame)
                .map_err(|e| AnalysisError::frame(index, FrameStage::Write, e))?;

            if index % interval == 0 {
                reporter.report(JobUpdate::progress(clock.meta(index)));
            }

            next = source
                .read_frame()
                .map_err(|e| AnalysisError::frame(index + 1, FrameStage::Read, e))?;
        }

        // ===== FINALIZING =====
        self.state = PipelineState::Finalizing;
        let written = guard.frames_written();
        let video_path = guard
            .commit()
            .map_err(|e| AnalysisError::frame(index, FrameStage::Write, e))?;

        let stats = AnalysisStats::new(
            input,
            Path::new(self.detector.model_name()),
            info.frame_count,
            index,
            info.fps,
            clock.elapsed().as_secs_f64(),
            processor.ledger(),
        );
        let stats_saved = stats.save_soft(&output.stats);
        info!(
            frames = written,
            video = %video_path.display(),
            "🏁 视频写入完成"
        );

        Ok(AnalysisResult {
            video_path,
            stats_path: output.stats.clone(),
            stats,
            stats_saved,
        })
    }

    fn open_output(
        &self,
        backend: &dyn VideoBackend,
        requested: &Path,
        info: &VideoInfo,
    ) -> PipelineResult<OutputGuard> {
        let opened = open_sink_with_fallback(backend, requested, &self.config.output.codecs, info)?;
        let queue = self.config.output.writer_queue;
        if queue == 0 {
            return Ok(OutputGuard::new(opened));
        }

        let OpenedSink { sink, path, codec } = opened;
        let sink = ThreadedSink::spawn(sink, queue)
            .map_err(|e| AnalysisError::frame(1, FrameStage::Write, e))?;
        Ok(OutputGuard::new(OpenedSink {
            sink: Box::new(sink),
            path,
            codec,
        }))
    }

    /// Frames between progress events, at least 1.
    fn progress_interval(&self, fps: f64) -> u64 {
        self.config
            .output
            .progress_interval
            .unwrap_or_else(|| fps.round().max(0.0) as u64)
            .max(1)
    }
}

/// Open and probe the input. The probe frame is handed back so it can be
/// processed as frame 1.
fn open_input(
    backend: &dyn VideoBackend,
    input: &Path,
) -> PipelineResult<(Box<dyn FrameSource>, RgbImage)> {
    if !input.is_file() {
        return Err(AnalysisError::input_missing(InputKind::Video, input));
    }
    let mut source = backend
        .open_source(input)
        .map_err(|e| AnalysisError::invalid_video(e.to_string()))?;

    let info = source.info().clone();
    if info.fps.is_nan() || info.fps <= 0.0 {
        return Err(AnalysisError::invalid_video(format!(
            "frame rate is {}",
            info.fps
        )));
    }
    if info.frame_count == 0 {
        return Err(AnalysisError::invalid_video("frame count is 0"));
    }

    let first = match source.read_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => return Err(AnalysisError::invalid_video("first frame could not be read")),
        Err(e) => {
            return Err(AnalysisError::invalid_video(format!(
                "first frame could not be read: {}",
                e
            )))
        }
    };
    if first.width() != info.width || first.height() != info.height {
        warn!(
            reported = ?(info.width, info.height),
            actual = ?first.dimensions(),
            "container size differs from decoded frames, writing at decoded size"
        );
    }
    Ok((source, first))
}
