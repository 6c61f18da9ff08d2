//! 统计结果
//! Final statistics record and the result paths handed back to the job.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{AnalysisError, PipelineResult};
use crate::possession::PossessionLedger;
use crate::team::Team;

/// Per-team value keyed `team1` / `team2`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamPair<T> {
    pub team1: T,
    pub team2: T,
}

impl<T: Copy> TeamPair<T> {
    pub fn get(&self, team: Team) -> T {
        match team {
            Team::One => self.team1,
            Team::Two => self.team2,
        }
    }
}

/// 分析统计 (JSON)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub source_video: String,
    pub model_used: String,
    pub total_frames: u64,
    pub frames_processed: u64,
    pub duration_seconds: f64,
    pub processing_time_seconds: f64,
    pub ball_possession_frames: TeamPair<u64>,
    pub ball_possession_percent: TeamPair<f64>,
    pub offsides_calculated: bool,
    pub total_offsides: u32,
}

impl AnalysisStats {
    pub fn new(
        source_video: &Path,
        model: &Path,
        total_frames: u64,
        frames_processed: u64,
        fps: f64,
        processing_time_seconds: f64,
        ledger: &PossessionLedger,
    ) -> Self {
        let file_name = |p: &Path| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        Self {
            source_video: file_name(source_video),
            model_used: file_name(model),
            total_frames,
            frames_processed,
            duration_seconds: if fps > 0.0 {
                total_frames as f64 / fps
            } else {
                0.0
            },
            processing_time_seconds,
            ball_possession_frames: TeamPair {
                team1: ledger.count(Team::One),
                team2: ledger.count(Team::Two),
            },
            ball_possession_percent: TeamPair {
                team1: round2(ledger.percent(Team::One)),
                team2: round2(ledger.percent(Team::Two)),
            },
            offsides_calculated: false,
            total_offsides: 0,
        }
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let persist_err = |message: String| AnalysisError::StatsPersist {
            path: path.to_path_buf(),
            message,
        };
        let json = serde_json::to_string_pretty(self).map_err(|e| persist_err(e.to_string()))?;
        fs::write(path, json).map_err(|e| persist_err(e.to_string()))?;
        info!(path = %path.display(), "statistics saved");
        Ok(())
    }

    /// Save, logging a failure instead of returning it. Returns whether the
    /// file was written.
    pub fn save_soft(&self, path: &Path) -> bool {
        match self.save(path) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "statistics not saved, video output is kept");
                false
            }
        }
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| AnalysisError::StatsPersist {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Produced once per successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisResult {
    pub video_path: PathBuf,
    pub stats_path: PathBuf,
    pub stats: AnalysisStats,
    /// False when the stats file could not be written.
    pub stats_saved: bool,
}

impl AnalysisResult {
    /// `<result folder name>/<file name>`, as served to clients.
    pub fn relative_video_path(&self) -> String {
        relative_to_parent(&self.video_path)
    }

    pub fn relative_stats_path(&self) -> String {
        relative_to_parent(&self.stats_path)
    }
}

fn relative_to_parent(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
    {
        Some(folder) => format!("{}/{}", folder, file),
        None => file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(team1: u32, team2: u32) -> PossessionLedger {
        let mut ledger = PossessionLedger::new();
        for _ in 0..team1 {
            ledger.record(Team::One);
        }
        for _ in 0..team2 {
            ledger.record(Team::Two);
        }
        ledger
    }

    #[test]
    fn test_percentages_sum_to_100() {
        let stats = AnalysisStats::new(
            Path::new("/uploads/match.mp4"),
            Path::new("models/best.onnx"),
            300,
            300,
            30.0,
            12.0,
            &ledger(2, 1),
        );
        assert_eq!(stats.source_video, "match.mp4");
        assert_eq!(stats.model_used, "best.onnx");
        assert_eq!(stats.duration_seconds, 10.0);
        assert_eq!(stats.ball_possession_percent.team1, 66.67);
        assert_eq!(stats.ball_possession_percent.team2, 33.33);
        let sum = stats.ball_possession_percent.team1 + stats.ball_possession_percent.team2;
        assert!((sum - 100.0).abs() < 0.02);
    }

    #[test]
    fn test_json_field_names() {
        let stats = AnalysisStats::new(
            Path::new("a.mp4"),
            Path::new("m.onnx"),
            10,
            10,
            0.0,
            1.0,
            &ledger(0, 0),
        );
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ball_possession_frames"]["team1"], 0);
        assert_eq!(json["ball_possession_percent"]["team2"], 0.0);
        assert_eq!(json["offsides_calculated"], false);
        assert_eq!(json["total_offsides"], 0);
        assert_eq!(json["duration_seconds"], 0.0);
    }

    #[test]
    fn test_save_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stats = AnalysisStats::new(
            Path::new("a.mp4"),
            Path::new("m.onnx"),
            1,
            1,
            25.0,
            0.1,
            &ledger(1, 0),
        );
        let missing_dir = dir.path().join("nope").join("stats.json");
        assert!(!stats.save_soft(&missing_dir));

        let path = dir.path().join("stats.json");
        assert!(stats.save_soft(&path));
        assert_eq!(AnalysisStats::load(&path).unwrap(), stats);
    }

    #[test]
    fn test_relative_paths() {
        let stats = AnalysisStats::new(
            Path::new("a.mp4"),
            Path::new("m.onnx"),
            1,
            1,
            25.0,
            0.1,
            &ledger(0, 0),
        );
        let result = AnalysisResult {
            video_path: PathBuf::from("/srv/app/results/out_1.mp4"),
            stats_path: PathBuf::from("/srv/app/results/out_1.json"),
            stats,
            stats_saved: true,
        };
        assert_eq!(result.relative_video_path(), "results/out_1.mp4");
        assert_eq!(result.relative_stats_path(), "results/out_1.json");
    }
}
