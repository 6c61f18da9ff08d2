/// 检测系统数据结构定义
/// Data structures shared by the detector, the trackers and the annotator.
use std::fmt;

use thiserror::Error;

// ========== 类别表 ==========

/// Fixed class taxonomy.
///
/// `Ball`..`Referee` are detector outputs; `Team1`, `Team2` and
/// `ActivePlayer` are assigned by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassId {
    Ball = 0,
    Goalkeeper = 1,
    Player = 2,
    Referee = 3,
    Team1 = 4,
    Team2 = 5,
    ActivePlayer = 6,
}

impl ClassId {
    pub const ALL: [ClassId; 7] = [
        ClassId::Ball,
        ClassId::Goalkeeper,
        ClassId::Player,
        ClassId::Referee,
        ClassId::Team1,
        ClassId::Team2,
        ClassId::ActivePlayer,
    ];

    /// Classes the detector itself is expected to emit, in id order.
    pub const DETECTOR_CLASSES: [ClassId; 4] = [
        ClassId::Ball,
        ClassId::Goalkeeper,
        ClassId::Player,
        ClassId::Referee,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassId::Ball => "ball",
            ClassId::Goalkeeper => "goalkeeper",
            ClassId::Player => "player",
            ClassId::Referee => "referee",
            ClassId::Team1 => "team1",
            ClassId::Team2 => "team2",
            ClassId::ActivePlayer => "active_player",
        }
    }

    /// Parse a class name. The misspelt `goalkepper` found in older model
    /// exports is folded into [`ClassId::Goalkeeper`].
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "goalkepper" => Some(ClassId::Goalkeeper),
            other => Self::ALL.iter().copied().find(|c| c.name() == other),
        }
    }

    /// Check detector class names against the taxonomy: position `i` must
    /// name the class whose id is `i`.
    pub fn validate_detector_names(names: &[String]) -> Result<(), String> {
        for (idx, expected) in Self::DETECTOR_CLASSES.iter().enumerate() {
            let Some(name) = names.get(idx) else {
                return Err(format!(
                    "detector exposes {} classes, expected at least {}",
                    names.len(),
                    Self::DETECTOR_CLASSES.len()
                ));
            };
            match Self::from_name(name) {
                Some(class) if class == *expected => {}
                Some(class) => {
                    return Err(format!(
                        "detector class {} is '{}' ({}), expected '{}'",
                        idx,
                        name,
                        class.name(),
                        expected.name()
                    ))
                }
                None => {
                    return Err(format!(
                        "detector class {} '{}' is not a known category",
                        idx, name
                    ))
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ========== 检测框 ==========

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Bottom-centre anchor, where markers under a player's feet go.
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    pub fn top_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y1)
    }

    /// Grow the box outward by `px` on every side.
    pub fn pad(&self, px: f32) -> Self {
        Self::new(self.x1 - px, self.y1 - px, self.x2 + px, self.y2 + px)
    }

    /// Finite corners with `x1 <= x2` and `y1 <= y2`.
    pub fn is_well_formed(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 <= self.x2
            && self.y1 <= self.y2
    }

    /// 计算两个边界框的IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

// ========== 检测结果 ==========

/// A single object instance found in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: ClassId,
    pub confidence: f32,
    /// `None` until a tracker assigns an identity.
    pub tracker_id: Option<u32>,
}

impl Detection {
    pub fn new(bbox: BBox, class_id: ClassId, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
            tracker_id: None,
        }
    }

    pub fn with_tracker_id(mut self, id: u32) -> Self {
        self.tracker_id = Some(id);
        self
    }
}

/// Raised by [`DetectionSet::merge`] when an input box is malformed.
#[derive(Debug, Error, PartialEq)]
#[error("malformed bbox at set {set}, index {index}: {bbox:?}")]
pub struct MalformedDetection {
    pub set: usize,
    pub index: usize,
    pub bbox: BBox,
}

/// Ordered detections sharing a semantic category for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSet {
    items: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(items: Vec<Detection>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.items.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Detection> {
        self.items.get(idx)
    }

    pub fn push(&mut self, detection: Detection) {
        self.items.push(detection);
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Detection> {
        self.items
    }

    pub fn filter_class(&self, class_id: ClassId) -> Self {
        self.items
            .iter()
            .filter(|d| d.class_id == class_id)
            .cloned()
            .collect()
    }

    /// Select detections by index, preserving the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        indices
            .iter()
            .filter_map(|&i| self.items.get(i).cloned())
            .collect()
    }

    pub fn padded(mut self, px: f32) -> Self {
        for d in &mut self.items {
            d.bbox = d.bbox.pad(px);
        }
        self
    }

    /// 非极大值抑制: class-agnostic greedy NMS, highest confidence first.
    /// Survivors keep their original relative order.
    pub fn with_nms(&self, iou_threshold: f32) -> Self {
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by(|&a, &b| {
            self.items[b]
                .confidence
                .total_cmp(&self.items[a].confidence)
        });

        let mut kept: Vec<usize> = Vec::with_capacity(order.len());
        for idx in order {
            let drop = kept
                .iter()
                .any(|&k| self.items[k].bbox.iou(&self.items[idx].bbox) > iou_threshold);
            if !drop {
                kept.push(idx);
            }
        }
        kept.sort_unstable();
        self.select(&kept)
    }

    /// Concatenate sets in order. Fails on the first malformed box.
    pub fn merge(sets: &[&DetectionSet]) -> Result<DetectionSet, MalformedDetection> {
        let mut items = Vec::with_capacity(sets.iter().map(|s| s.len()).sum());
        for (set_idx, set) in sets.iter().enumerate() {
            for (index, det) in set.iter().enumerate() {
                if !det.bbox.is_well_formed() {
                    return Err(MalformedDetection {
                        set: set_idx,
                        index,
                        bbox: det.bbox,
                    });
                }
                items.push(det.clone());
            }
        }
        Ok(DetectionSet { items })
    }

    pub fn tracker_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.items.iter().filter_map(|d| d.tracker_id)
    }
}

impl FromIterator<Detection> for DetectionSet {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for DetectionSet {
    type Item = Detection;
    type IntoIter = std::vec::IntoIter<Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, class_id: ClassId, conf: f32) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), class_id, conf)
    }

    #[test]
    fn test_class_taxonomy_ids() {
        assert_eq!(ClassId::Ball.id(), 0);
        assert_eq!(ClassId::Goalkeeper.id(), 1);
        assert_eq!(ClassId::Player.id(), 2);
        assert_eq!(ClassId::Referee.id(), 3);
        assert_eq!(ClassId::Team1.id(), 4);
        assert_eq!(ClassId::Team2.id(), 5);
        assert_eq!(ClassId::ActivePlayer.id(), 6);
        assert_eq!(ClassId::from_id(3), Some(ClassId::Referee));
        assert_eq!(ClassId::from_id(9), None);
    }

    #[test]
    fn test_goalkeeper_alias() {
        assert_eq!(ClassId::from_name("goalkepper"), Some(ClassId::Goalkeeper));
        assert_eq!(ClassId::from_name("Goalkeeper"), Some(ClassId::Goalkeeper));
        assert_eq!(ClassId::from_name("keeper"), None);
    }

    #[test]
    fn test_validate_detector_names() {
        let ok: Vec<String> = ["ball", "goalkepper", "player", "referee"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(ClassId::validate_detector_names(&ok).is_ok());

        let swapped: Vec<String> = ["ball", "player", "goalkeeper", "referee"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = ClassId::validate_detector_names(&swapped).unwrap_err();
        assert!(err.contains("expected 'goalkeeper'"));

        let short = vec!["ball".to_string()];
        assert!(ClassId::validate_detector_names(&short).is_err());
    }

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_order_of_survivors() {
        let set = DetectionSet::new(vec![
            det(0.0, 0.0, 10.0, 10.0, ClassId::Player, 0.5),
            det(100.0, 0.0, 110.0, 10.0, ClassId::Player, 0.6),
            det(1.0, 0.0, 11.0, 10.0, ClassId::Player, 0.9),
        ]);
        let kept = set.with_nms(0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.get(0).map(|d| d.confidence), Some(0.6));
        assert_eq!(kept.get(1).map(|d| d.confidence), Some(0.9));
    }

    #[test]
    fn test_filter_and_merge() {
        let set = DetectionSet::new(vec![
            det(0.0, 0.0, 5.0, 5.0, ClassId::Ball, 0.8),
            det(10.0, 10.0, 30.0, 60.0, ClassId::Player, 0.9),
            det(40.0, 10.0, 60.0, 60.0, ClassId::Referee, 0.7),
        ]);
        let players = set.filter_class(ClassId::Player);
        let referees = set.filter_class(ClassId::Referee);
        assert_eq!(players.len(), 1);

        let merged = DetectionSet::merge(&[&players, &DetectionSet::empty(), &referees]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(0).map(|d| d.class_id), Some(ClassId::Player));
        assert_eq!(merged.get(1).map(|d| d.class_id), Some(ClassId::Referee));
    }

    #[test]
    fn test_merge_rejects_malformed_box() {
        let good = DetectionSet::new(vec![det(0.0, 0.0, 5.0, 5.0, ClassId::Team1, 0.8)]);
        let bad = DetectionSet::new(vec![det(0.0, f32::NAN, 5.0, 5.0, ClassId::Team2, 0.8)]);
        let err = DetectionSet::merge(&[&good, &bad]).unwrap_err();
        assert_eq!(err.set, 1);
        assert_eq!(err.index, 0);
    }

    #[test]
    fn test_pad() {
        let b = BBox::new(10.0, 10.0, 20.0, 20.0).pad(10.0);
        assert_eq!(b, BBox::new(0.0, 0.0, 30.0, 30.0));
    }
}
