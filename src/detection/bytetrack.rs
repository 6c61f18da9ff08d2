//! ByteTrack 多目标跟踪
//!
//! Detections are split by score. Confident boxes are associated with every
//! live track first; the leftover tracks then get a second chance against
//! low-score boxes, which keeps ids alive through occlusion and motion blur.
//! Only confident boxes may start a track. Association is IoU on the
//! Kalman-predicted boxes, no appearance features.
//!
//! One instance is created per team, so ids only need to be unique within a
//! tracker. Ids come from a monotonically increasing counter and are never
//! handed out twice in the lifetime of a tracker, even after `reset`.

use super::tracker::{compute_iou, KalmanBoxFilter, Tracker};
use super::types::{BBox, DetectionSet};
use crate::config::TrackerConfig;

/// ByteTrack 跟踪轨迹
#[derive(Clone, Debug)]
struct Track {
    id: u32,
    /// 卡尔曼滤波平滑后的边界框
    bbox: BBox,
    kalman: KalmanBoxFilter,
    /// 连续丢失帧数
    frames_lost: u32,
}

impl Track {
    fn new(id: u32, bbox: &BBox) -> Self {
        // 低观测噪声: 更信任检测结果,快速响应移动
        let kalman = KalmanBoxFilter::new(bbox, 0.1, 0.5);
        Self {
            id,
            bbox: kalman.state_bbox(),
            kalman,
            frames_lost: 0,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.bbox = self.kalman.state_bbox();
    }

    fn update(&mut self, bbox: &BBox) {
        self.kalman.update(bbox);
        self.bbox = self.kalman.state_bbox();
        self.frames_lost = 0;
    }
}

/// ByteTrack 追踪器
#[derive(Debug)]
pub struct ByteTracker {
    tracks: Vec<Track>,
    next_id: u32,
    config: TrackerConfig,
}

impl ByteTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            config: config.clone(),
        }
    }

    fn start_track(&mut self, bbox: &BBox) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.push(Track::new(id, bbox));
        id
    }
}

/// 贪心关联: pairs sorted by descending IoU, each detection and each track
/// used at most once. Equal IoU keeps detection order.
fn associate(
    boxes: &[BBox],
    candidates: &[usize],
    tracks: &[Track],
    open_tracks: &[usize],
    min_iou: f32,
) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(f32, usize, usize)> = candidates
        .iter()
        .flat_map(|&d| {
            open_tracks
                .iter()
                .map(move |&t| (compute_iou(&boxes[d], &tracks[t].bbox), d, t))
        })
        .filter(|(iou, _, _)| *iou >= min_iou)
        .collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut det_taken = vec![false; boxes.len()];
    let mut track_taken = vec![false; tracks.len()];
    let mut matches = Vec::with_capacity(pairs.len().min(open_tracks.len()));
    for (_, d, t) in pairs {
        if det_taken[d] || track_taken[t] {
            continue;
        }
        det_taken[d] = true;
        track_taken[t] = true;
        matches.push((d, t));
    }
    matches
}

impl Tracker for ByteTracker {
    fn update(&mut self, detections: &DetectionSet) -> DetectionSet {
        let dets = detections.as_slice();
        let boxes: Vec<BBox> = dets.iter().map(|d| d.bbox).collect();

        for track in &mut self.tracks {
            track.predict();
        }

        let (strong, weak): (Vec<usize>, Vec<usize>) = (0..dets.len())
            .filter(|&i| dets[i].confidence >= self.config.low_score_threshold)
            .partition(|&i| dets[i].confidence >= self.config.high_score_threshold);

        let mut ids: Vec<Option<u32>> = vec![None; dets.len()];
        let mut seen = vec![false; self.tracks.len()];

        // 高分框: 与全部轨迹匹配
        let every_track: Vec<usize> = (0..self.tracks.len()).collect();
        let first = associate(
            &boxes,
            &strong,
            &self.tracks,
            &every_track,
            self.config.high_iou_threshold,
        );
        for (d, t) in first {
            self.tracks[t].update(&dets[d].bbox);
            seen[t] = true;
            ids[d] = Some(self.tracks[t].id);
        }

        // 低分框: 只救援剩下的轨迹
        let leftover: Vec<usize> = (0..self.tracks.len()).filter(|&t| !seen[t]).collect();
        let second = associate(
            &boxes,
            &weak,
            &self.tracks,
            &leftover,
            self.config.low_iou_threshold,
        );
        for (d, t) in second {
            self.tracks[t].update(&dets[d].bbox);
            seen[t] = true;
            ids[d] = Some(self.tracks[t].id);
        }

        for (track, _) in self.tracks.iter_mut().zip(&seen).filter(|(_, s)| !**s) {
            track.frames_lost += 1;
        }

        for &d in &strong {
            if ids[d].is_none() {
                ids[d] = Some(self.start_track(&dets[d].bbox));
            }
        }

        let max_lost = self.config.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        dets.iter()
            .zip(ids)
            .filter_map(|(det, id)| id.map(|id| det.clone().with_tracker_id(id)))
            .collect()
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}
