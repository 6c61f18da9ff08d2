//! 任务进度上报
//! Job state updates sent to an external job-status collaborator.
//!
//! Updates are idempotent snapshots; a reporter may drop them without
//! affecting the analysis itself.

use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
}

/// `{current, total, status}` without timing, used for STARTED.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusMeta {
    pub current: u64,
    pub total: u64,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    pub current: u64,
    pub total: u64,
    pub status: String,
    pub eta: String,
    pub rate: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessMeta {
    pub current: u64,
    pub total: u64,
    pub status: String,
    pub result_video: String,
    pub result_stats: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureMeta {
    pub exc_type: String,
    pub exc_message: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobMeta {
    Progress(ProgressMeta),
    Success(SuccessMeta),
    Failure(FailureMeta),
    Status(StatusMeta),
}

/// One state transition with its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub state: JobState,
    pub meta: JobMeta,
}

impl JobUpdate {
    pub fn started() -> Self {
        Self {
            state: JobState::Started,
            meta: JobMeta::Status(StatusMeta {
                current: 0,
                total: 100,
                status: "Processing starting...".to_string(),
            }),
        }
    }

    pub fn progress(meta: ProgressMeta) -> Self {
        Self {
            state: JobState::Progress,
            meta: JobMeta::Progress(meta),
        }
    }

    pub fn success(result_video: String, result_stats: String) -> Self {
        Self {
            state: JobState::Success,
            meta: JobMeta::Success(SuccessMeta {
                current: 100,
                total: 100,
                status: "Processing complete!".to_string(),
                result_video,
                result_stats,
            }),
        }
    }

    pub fn failure(exc_type: &str, exc_message: String, status: String) -> Self {
        Self {
            state: JobState::Failure,
            meta: JobMeta::Failure(FailureMeta {
                exc_type: exc_type.to_string(),
                exc_message,
                status,
            }),
        }
    }
}

// ========== 上报器 ==========

/// Sink for job updates. Must never block the frame loop for long.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: JobUpdate);
}

/// Writes updates to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, update: JobUpdate) {
        match &update.meta {
            JobMeta::Progress(m) => info!(
                current = m.current,
                total = m.total,
                eta = %m.eta,
                rate = %m.rate,
                "{}", m.status
            ),
            JobMeta::Status(m) => info!(state = ?update.state, "{}", m.status),
            JobMeta::Success(m) => info!(
                video = %m.result_video,
                stats = %m.result_stats,
                "{}", m.status
            ),
            JobMeta::Failure(m) => info!(
                exc_type = %m.exc_type,
                exc_message = %m.exc_message,
                "{}", m.status
            ),
        }
    }
}

/// Forwards updates over a bounded channel; drops them when it is full.
#[derive(Clone, Debug)]
pub struct ChannelReporter {
    tx: Sender<JobUpdate>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<JobUpdate>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, update: JobUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(u)) => debug!(state = ?u.state, "progress channel full, update dropped"),
            Err(TrySendError::Disconnected(u)) => {
                debug!(state = ?u.state, "progress receiver gone, update dropped")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _update: JobUpdate) {}
}

// ========== 计时 ==========

/// Tracks elapsed time and derives percentage, ETA and rate.
#[derive(Clone, Debug)]
pub struct ProgressClock {
    start: Instant,
    total: u64,
}

impl ProgressClock {
    pub fn start(total: u64) -> Self {
        Self {
            start: Instant::now(),
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn meta(&self, current: u64) -> ProgressMeta {
        self.meta_at(current, self.elapsed())
    }

    /// Snapshot after `elapsed`. The percentage is clamped to 100 for
    /// containers that under-report their length.
    pub fn meta_at(&self, current: u64, elapsed: Duration) -> ProgressMeta {
        let total = self.total.max(1);
        let percent = (current.saturating_mul(100) / total).min(100);

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 && current > 0 {
            Some(current as f64 / secs)
        } else {
            None
        };
        let eta = rate
            .map(|r| format_eta(self.total.saturating_sub(current) as f64 / r))
            .unwrap_or_default();

        ProgressMeta {
            current,
            total: self.total,
            status: format!("Analyzing video: {}%", percent),
            eta,
            rate: format_rate(rate),
        }
    }
}

/// `H:MM:SS` from one hour, `M:SS` from one minute, `{:.2}s` below.
pub fn format_eta(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds >= 3600.0 {
        let whole = seconds as u64;
        format!("{}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
    } else if seconds >= 60.0 {
        let whole = seconds as u64;
        format!("{}:{:02}", whole / 60, whole % 60)
    } else {
        format!("{:.2}s", seconds)
    }
}

/// `"{:.2}it/s"`, empty when no rate is known yet.
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) if r > 0.0 && r.is_finite() => format!("{:.2}it/s", r),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(3725.0), "1:02:05");
        assert_eq!(format_eta(75.9), "1:15");
        assert_eq!(format_eta(12.5), "12.50s");
        assert_eq!(format_eta(-1.0), "0.00s");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(Some(25.0)), "25.00it/s");
        assert_eq!(format_rate(Some(0.0)), "");
        assert_eq!(format_rate(None), "");
    }

    #[test]
    fn test_meta_at() {
        let clock = ProgressClock::start(200);
        let meta = clock.meta_at(50, Duration::from_secs(10));
        assert_eq!(meta.status, "Analyzing video: 25%");
        assert_eq!(meta.rate, "5.00it/s");
        assert_eq!(meta.eta, "30.00s");

        // under-reported length
        let meta = clock.meta_at(250, Duration::from_secs(10));
        assert_eq!(meta.status, "Analyzing video: 100%");
        assert_eq!(meta.eta, "0.00s");

        let meta = clock.meta_at(0, Duration::ZERO);
        assert_eq!(meta.rate, "");
        assert_eq!(meta.eta, "");
    }

    #[test]
    fn test_update_json_shape() {
        let json = serde_json::to_value(JobUpdate::started()).unwrap();
        assert_eq!(json["state"], "STARTED");
        assert_eq!(json["meta"]["status"], "Processing starting...");
        assert!(json["meta"].get("eta").is_none());

        let json = serde_json::to_value(JobUpdate::success(
            "results/a.mp4".into(),
            "results/a.json".into(),
        ))
        .unwrap();
        assert_eq!(json["state"], "SUCCESS");
        assert_eq!(json["meta"]["current"], 100);
        assert_eq!(json["meta"]["result_video"], "results/a.mp4");
    }

    #[test]
    fn test_channel_reporter_drops_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reporter = ChannelReporter::new(tx);
        reporter.report(JobUpdate::started());
        reporter.report(JobUpdate::started());
        assert_eq!(rx.try_iter().count(), 1);
    }
}
