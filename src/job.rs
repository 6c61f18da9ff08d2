//! 分析任务
//! Job runner surface: one request in, state updates and result paths out.
//! The HTTP layer and the queue broker live outside this crate; this module
//! gives them what they call.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{error, info, info_span};

use crate::config::{AnalyzerConfig, DetectorConfig};
use crate::detection::{Detector, OnnxDetector};
use crate::error::{AnalysisError, ErrorKind, InputKind, PipelineResult};
use crate::pipeline::{
    AnalysisResult, CancelToken, ChannelReporter, JobUpdate, OutputPaths, ProgressReporter,
    VideoAnalyzer,
};
use crate::video::VideoBackend;

/// Upload extensions accepted for analysis.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Headers sent with video artifacts so browsers do not cache them.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// One analysis job.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub input: PathBuf,
    pub model: PathBuf,
    pub result_dir: PathBuf,
    pub video_name: String,
    pub stats_name: String,
    pub config: AnalyzerConfig,
}

impl JobRequest {
    /// Request with output names derived from `job_id`:
    /// `{job_id}_processed.mp4` and `{job_id}_stats.json`.
    pub fn new(
        input: impl Into<PathBuf>,
        model: impl Into<PathBuf>,
        result_dir: impl Into<PathBuf>,
        job_id: &str,
    ) -> Self {
        Self {
            input: input.into(),
            model: model.into(),
            result_dir: result_dir.into(),
            video_name: format!("{}_processed.mp4", job_id),
            stats_name: format!("{}_stats.json", job_id),
            config: AnalyzerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalyzerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn output_paths(&self) -> OutputPaths {
        OutputPaths {
            video: self.result_dir.join(&self.video_name),
            stats: self.result_dir.join(&self.stats_name),
        }
    }
}

/// Load the YOLOv8 ONNX detector. The default loader for [`run_job`].
pub fn load_onnx_detector(model: &Path, config: &DetectorConfig) -> PipelineResult<Box<dyn Detector>> {
    Ok(Box::new(OnnxDetector::new(model, config)?))
}

/// Run one job to completion on the current thread, reporting STARTED,
/// PROGRESS ticks and then SUCCESS or FAILURE.
pub fn run_job<L>(
    request: &JobRequest,
    backend: &dyn VideoBackend,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
    load_detector: L,
) -> PipelineResult<AnalysisResult>
where
    L: FnOnce(&Path, &DetectorConfig) -> PipelineResult<Box<dyn Detector>>,
{
    let _span = info_span!("job", input = %request.input.display()).entered();
    reporter.report(JobUpdate::started());

    let result = execute(request, backend, reporter, cancel, load_detector);
    match &result {
        Ok(r) => {
            info!(video = %r.video_path.display(), "job finished");
            reporter.report(JobUpdate::success(
                r.relative_video_path(),
                r.relative_stats_path(),
            ));
        }
        Err(e) => {
            error!(kind = e.kind().as_str(), error = %e, "job failed");
            reporter.report(failure_update(e));
        }
    }
    result
}

fn execute<L>(
    request: &JobRequest,
    backend: &dyn VideoBackend,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
    load_detector: L,
) -> PipelineResult<AnalysisResult>
where
    L: FnOnce(&Path, &DetectorConfig) -> PipelineResult<Box<dyn Detector>>,
{
    if !request.model.is_file() {
        return Err(AnalysisError::input_missing(InputKind::Model, &request.model));
    }
    if !request.input.is_file() {
        return Err(AnalysisError::input_missing(InputKind::Video, &request.input));
    }
    fs::create_dir_all(&request.result_dir)?;

    let detector = load_detector(&request.model, &request.config.detector)?;
    let mut analyzer = VideoAnalyzer::new(detector, request.config.clone())?;
    analyzer.analyze(
        backend,
        &request.input,
        &request.output_paths(),
        reporter,
        cancel,
    )
}

/// FAILURE payload for `err`.
pub fn failure_update(err: &AnalysisError) -> JobUpdate {
    let kind = err.kind();
    let status = match kind {
        ErrorKind::InputMissing => "Error: Input file or model not found.".to_string(),
        _ => format!("Processing failed due to an internal error: {}", kind.as_str()),
    };
    JobUpdate::failure(kind.as_str(), err.to_string(), status)
}

// ========== 后台任务 ==========

/// Handle to a job running on its own thread.
pub struct JobHandle {
    updates: Receiver<JobUpdate>,
    cancel: CancelToken,
    handle: JoinHandle<PipelineResult<AnalysisResult>>,
}

impl JobHandle {
    /// State updates. Updates are dropped when nobody drains the channel.
    pub fn updates(&self) -> &Receiver<JobUpdate> {
        &self.updates
    }

    /// Ask the job to stop before its next frame.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> PipelineResult<AnalysisResult> {
        self.handle
            .join()
            .map_err(|_| AnalysisError::Io(io::Error::other("analysis thread panicked")))?
    }
}

/// Run a job on a dedicated thread. Each job owns its backend, detector and
/// pipeline state; nothing is shared between jobs.
pub fn spawn_job<B, L>(
    request: JobRequest,
    backend: B,
    load_detector: L,
    updates_capacity: usize,
) -> PipelineResult<JobHandle>
where
    B: VideoBackend + Send + 'static,
    L: FnOnce(&Path, &DetectorConfig) -> PipelineResult<Box<dyn Detector>> + Send + 'static,
{
    let (tx, rx) = bounded(updates_capacity.max(1));
    let cancel = CancelToken::new();
    let token = cancel.clone();

    let handle = thread::Builder::new()
        .name("analysis-job".to_string())
        .spawn(move || {
            let reporter = ChannelReporter::new(tx);
            run_job(&request, &backend, &reporter, &token, load_detector)
        })?;

    Ok(JobHandle {
        updates: rx,
        cancel,
        handle,
    })
}

// ========== 上传与下载 ==========

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Whether an uploaded file name has an accepted video extension.
pub fn is_allowed_video(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Content type of a result artifact, `None` when unknown.
pub fn content_type_for(path: impl AsRef<Path>) -> Option<&'static str> {
    let ext = extension(&path.as_ref().to_string_lossy())?;
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "avi" => Some("video/x-msvideo"),
        "webm" => Some("video/webm"),
        "json" => Some("application/json"),
        _ => None,
    }
}

/// Video artifacts are served with [`NO_CACHE_HEADERS`].
pub fn is_video_artifact(path: impl AsRef<Path>) -> bool {
    matches!(
        extension(&path.as_ref().to_string_lossy()).as_deref(),
        Some("mp4" | "avi" | "webm")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JobMeta, JobState};

    #[test]
    fn test_allowed_extensions() {
        assert!(is_allowed_video("match.MP4"));
        assert!(is_allowed_video("a.b.mkv"));
        assert!(is_allowed_video("clip.mov"));
        assert!(!is_allowed_video("notes.txt"));
        assert!(!is_allowed_video("mp4"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("results/x_processed.mp4"), Some("video/mp4"));
        assert_eq!(content_type_for("x.AVI"), Some("video/x-msvideo"));
        assert_eq!(content_type_for("x_stats.json"), Some("application/json"));
        assert_eq!(content_type_for("x.bin"), None);
        assert!(is_video_artifact("x.webm"));
        assert!(!is_video_artifact("x.json"));
    }

    #[test]
    fn test_request_names() {
        let req = JobRequest::new("up/a.mp4", "models/best.onnx", "results", "abc123");
        let out = req.output_paths();
        assert_eq!(out.video, PathBuf::from("results/abc123_processed.mp4"));
        assert_eq!(out.stats, PathBuf::from("results/abc123_stats.json"));
    }

    #[test]
    fn test_failure_status_text() {
        let update = failure_update(&AnalysisError::input_missing(InputKind::Video, "a.mp4"));
        assert_eq!(update.state, JobState::Failure);
        match update.meta {
            JobMeta::Failure(m) => {
                assert_eq!(m.exc_type, "InputMissingError");
                assert_eq!(m.status, "Error: Input file or model not found.");
            }
            other => panic!("unexpected meta {:?}", other),
        }

        let update = failure_update(&AnalysisError::invalid_video("fps is 0"));
        match update.meta {
            JobMeta::Failure(m) => assert_eq!(
                m.status,
                "Processing failed due to an internal error: InvalidVideoError"
            ),
            other => panic!("unexpected meta {:?}", other),
        }
    }
}
