/// 帧标注 (Frame Annotator)
///
/// 在每帧上绘制球队标记、编号、球标记与控球率记分牌
/// - heatmap: 可选的球员位置热力图
pub mod heatmap;

use std::fs;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_line_segment_mut, draw_polygon_mut, draw_text_mut, text_size,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::config::AnnotationConfig;
use crate::detection::types::{Detection, DetectionSet};
use crate::possession::PossessionLedger;
use crate::team::Team;
use heatmap::Heatmap;

/// Fonts tried when no font path is configured.
const SYSTEM_FONTS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
];

// ========== 颜色 ==========

pub const TEAM1_COLOR: Rgb<u8> = Rgb([0x1E, 0x90, 0xFF]);
pub const TEAM2_COLOR: Rgb<u8> = Rgb([0xDC, 0x14, 0x3C]);
pub const REFEREE_COLOR: Rgb<u8> = Rgb([0xFF, 0xD7, 0x00]);
pub const GOALKEEPER_COLOR: Rgb<u8> = Rgb([0x32, 0xCD, 0x32]);
pub const BALL_COLOR: Rgb<u8> = Rgb([0xFF, 0x8C, 0x00]);
pub const ACTIVE_PLAYER_COLOR: Rgb<u8> = Rgb([0xFF, 0x00, 0x00]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const SCOREBOARD_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const SCOREBOARD_ALPHA: f32 = 0.4;

/// Display categories of one annotated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Team1,
    Team2,
    Referee,
    Goalkeeper,
    Ball,
    ActivePlayer,
}

impl Category {
    pub fn color(self) -> Rgb<u8> {
        match self {
            Category::Team1 => TEAM1_COLOR,
            Category::Team2 => TEAM2_COLOR,
            Category::Referee => REFEREE_COLOR,
            Category::Goalkeeper => GOALKEEPER_COLOR,
            Category::Ball => BALL_COLOR,
            Category::ActivePlayer => ACTIVE_PLAYER_COLOR,
        }
    }

    fn marker(self) -> Marker {
        match self {
            Category::Team1 | Category::Team2 | Category::Referee | Category::Goalkeeper => {
                Marker::Ellipse
            }
            Category::Ball => Marker::Triangle {
                base: 15.0,
                height: 15.0,
                anchor: Anchor::BottomCenter,
            },
            Category::ActivePlayer => Marker::Triangle {
                base: 20.0,
                height: 20.0,
                anchor: Anchor::TopCenter,
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Anchor {
    TopCenter,
    BottomCenter,
}

#[derive(Clone, Copy, Debug)]
enum Marker {
    /// Open ellipse under the feet
    Ellipse,
    /// Filled triangle pointing down at the anchor
    Triangle { base: f32, height: f32, anchor: Anchor },
}

/// Detections of one frame keyed by display category.
#[derive(Clone, Debug, Default)]
pub struct FrameDetections {
    pub team1: DetectionSet,
    pub team2: DetectionSet,
    pub referees: DetectionSet,
    pub goalkeepers: DetectionSet,
    pub ball: DetectionSet,
    pub active_player: DetectionSet,
}

impl FrameDetections {
    pub fn get(&self, category: Category) -> &DetectionSet {
        match category {
            Category::Team1 => &self.team1,
            Category::Team2 => &self.team2,
            Category::Referee => &self.referees,
            Category::Goalkeeper => &self.goalkeepers,
            Category::Ball => &self.ball,
            Category::ActivePlayer => &self.active_player,
        }
    }

    pub fn team(&self, team: Team) -> &DetectionSet {
        match team {
            Team::One => &self.team1,
            Team::Two => &self.team2,
        }
    }
}

/// Text drawn under each marker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Labels {
    pub team1: Vec<String>,
    pub team2: Vec<String>,
    pub referees: Vec<String>,
    pub goalkeepers: Vec<String>,
}

impl Labels {
    /// Tracker ids for players, fixed tags for officials and keepers.
    pub fn for_frame(detections: &FrameDetections) -> Self {
        let ids = |set: &DetectionSet| -> Vec<String> {
            set.iter()
                .map(|d| d.tracker_id.map(|id| id.to_string()).unwrap_or_default())
                .collect()
        };
        Self {
            team1: ids(&detections.team1),
            team2: ids(&detections.team2),
            referees: vec!["ref".to_string(); detections.referees.len()],
            goalkeepers: vec!["GK".to_string(); detections.goalkeepers.len()],
        }
    }

    /// Ball and active player markers carry no label.
    pub fn get(&self, category: Category) -> &[String] {
        match category {
            Category::Team1 => &self.team1,
            Category::Team2 => &self.team2,
            Category::Referee => &self.referees,
            Category::Goalkeeper => &self.goalkeepers,
            Category::Ball | Category::ActivePlayer => &[],
        }
    }
}

/// 帧标注器
pub struct FrameAnnotator {
    font: Option<FontVec>,
    heatmap: Option<Heatmap>,
}

impl FrameAnnotator {
    pub fn new(config: &AnnotationConfig) -> Self {
        let font = load_font(config.font_path.as_deref());
        if font.is_none() {
            warn!("no usable font found, labels and scoreboard text are skipped");
        }
        let heatmap = config
            .show_heatmap
            .then(|| Heatmap::new(config.heatmap_history, config.heatmap_opacity));
        Self { font, heatmap }
    }

    /// Annotator without text, for headless runs and tests.
    pub fn without_font(config: &AnnotationConfig) -> Self {
        let heatmap = config
            .show_heatmap
            .then(|| Heatmap::new(config.heatmap_history, config.heatmap_opacity));
        Self {
            font: None,
            heatmap,
        }
    }

    pub fn heatmap(&self) -> Option<&Heatmap> {
        self.heatmap.as_ref()
    }

    /// Draw every layer onto `frame` in place.
    pub fn annotate(
        &mut self,
        frame: &mut RgbImage,
        detections: &FrameDetections,
        labels: &Labels,
        ledger: &PossessionLedger,
    ) {
        if let Some(heatmap) = self.heatmap.as_mut() {
            heatmap.record(&detections.team1, &detections.team2);
            heatmap.render(frame);
        }

        for category in [
            Category::Team1,
            Category::Team2,
            Category::Referee,
            Category::Goalkeeper,
            Category::Ball,
        ] {
            self.draw_markers(frame, category, detections.get(category));
        }

        for category in [
            Category::Team1,
            Category::Team2,
            Category::Referee,
            Category::Goalkeeper,
        ] {
            let set = detections.get(category);
            let text = labels.get(category);
            if text.len() != set.len() {
                debug!(?category, labels = text.len(), detections = set.len(), "label count mismatch, skipped");
                continue;
            }
            for (det, label) in set.iter().zip(text) {
                self.draw_label(frame, det, label, category.color());
            }
        }

        self.draw_markers(frame, Category::ActivePlayer, &detections.active_player);
        self.draw_scoreboard(frame, ledger);
    }

    fn draw_markers(&self, frame: &mut RgbImage, category: Category, set: &DetectionSet) {
        let color = category.color();
        for det in set {
            match category.marker() {
                Marker::Ellipse => draw_ellipse_arc(frame, det, color),
                Marker::Triangle {
                    base,
                    height,
                    anchor,
                } => {
                    let (x, y) = match anchor {
                        Anchor::TopCenter => det.bbox.top_center(),
                        Anchor::BottomCenter => det.bbox.bottom_center(),
                    };
                    draw_triangle(frame, x, y, base, height, color);
                }
            }
        }
    }

    fn draw_label(&self, frame: &mut RgbImage, det: &Detection, label: &str, background: Rgb<u8>) {
        let Some(font) = self.font.as_ref() else {
            return;
        };
        if label.is_empty() {
            return;
        }
        let scale = PxScale::from(16.0);
        let (tw, th) = text_size(scale, font, label);
        let pad = 3i32;
        let (cx, bottom) = det.bbox.bottom_center();
        let x = cx as i32 - tw as i32 / 2 - pad;
        let y = bottom as i32 + 6;
        draw_filled_rect_mut(
            frame,
            Rect::at(x, y).of_size(tw + 2 * pad as u32, th + 2 * pad as u32),
            background,
        );
        draw_text_mut(frame, LABEL_TEXT_COLOR, x + pad, y + pad, scale, font, label);
    }

    /// Translucent panel in the top-right corner with possession shares.
    fn draw_scoreboard(&self, frame: &mut RgbImage, ledger: &PossessionLedger) {
        let (w, h) = frame.dimensions();
        let margin = (w / 40).clamp(2, 40);
        let panel_w = ((w as f32 * 0.33) as u32).clamp(60.min(w), 640).min(w.saturating_sub(2 * margin)).max(1);
        let panel_h = ((h as f32 * 0.08) as u32).clamp(24.min(h), 80).min(h.saturating_sub(2 * margin)).max(1);
        let x1 = w.saturating_sub(panel_w + margin);
        let y1 = margin.min(h.saturating_sub(panel_h));

        blend_rect(frame, x1, y1, panel_w, panel_h, Rgb([255, 255, 255]), SCOREBOARD_ALPHA);

        // 双色比例条
        let team1 = ledger.fraction(Team::One);
        let bar_h = (panel_h / 6).max(2);
        let bar_y = y1 + panel_h - bar_h - (panel_h / 10);
        let bar_x = x1 + panel_w / 20;
        let bar_w = panel_w - 2 * (panel_w / 20);
        if ledger.total() > 0 && bar_w > 0 {
            let split = (bar_w as f64 * team1).round() as u32;
            if split > 0 {
                draw_filled_rect_mut(
                    frame,
                    Rect::at(bar_x as i32, bar_y as i32).of_size(split, bar_h),
                    TEAM1_COLOR,
                );
            }
            if split < bar_w {
                draw_filled_rect_mut(
                    frame,
                    Rect::at((bar_x + split) as i32, bar_y as i32).of_size(bar_w - split, bar_h),
                    TEAM2_COLOR,
                );
            }
        }

        let Some(font) = self.font.as_ref() else {
            return;
        };
        let text_px = (panel_h as f32 * 0.28).clamp(8.0, 28.0);
        let scale = PxScale::from(text_px);
        let tx = (bar_x) as i32;
        let ty = (y1 + panel_h / 12) as i32;
        draw_text_mut(frame, SCOREBOARD_TEXT_COLOR, tx, ty, scale, font, "Ball Control");

        let (header_w, _) = text_size(scale, font, "Ball Control");
        let team1_text = format!("{:.1}%", ledger.percent(Team::One));
        let team2_text = format!("{:.1}%", ledger.percent(Team::Two));
        let (t1w, _) = text_size(scale, font, &team1_text);
        let x_team1 = tx + header_w as i32 + (text_px as i32);
        let x_team2 = x_team1 + t1w as i32 + (text_px as i32);
        draw_text_mut(frame, TEAM1_COLOR, x_team1, ty, scale, font, &team1_text);
        draw_text_mut(frame, TEAM2_COLOR, x_team2, ty, scale, font, &team2_text);
    }
}

fn load_font(path: Option<&str>) -> Option<FontVec> {
    let candidates: Vec<&str> = match path {
        Some(p) => vec![p],
        None => SYSTEM_FONTS.to_vec(),
    };
    for candidate in candidates {
        let Ok(bytes) = fs::read(candidate) else {
            continue;
        };
        match FontVec::try_from_vec(bytes) {
            Ok(font) => {
                info!(font = candidate, "annotation font loaded");
                return Some(font);
            }
            Err(e) => warn!(font = candidate, error = %e, "invalid font file"),
        }
    }
    None
}

/// Open ellipse centred on the bottom edge, gap behind the player.
fn draw_ellipse_arc(frame: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
    let (cx, cy) = det.bbox.bottom_center();
    let a = det.bbox.width().max(1.0);
    let b = 0.35 * a;
    let (start, end) = (-45.0f32, 235.0f32);
    let steps = ((end - start) / 4.0).ceil() as usize;

    // 2px thickness
    for grow in [0.0f32, 1.0] {
        let point = |deg: f32| {
            let t = deg.to_radians();
            (cx + (a + grow) * t.cos(), cy + (b + grow) * t.sin())
        };
        let mut prev = point(start);
        for i in 1..=steps {
            let deg = (start + i as f32 * 4.0).min(end);
            let next = point(deg);
            draw_line_segment_mut(frame, prev, next, color);
            prev = next;
        }
    }
}

fn draw_triangle(frame: &mut RgbImage, x: f32, y: f32, base: f32, height: f32, color: Rgb<u8>) {
    let half = base / 2.0;
    let tip = Point::new(x.round() as i32, y.round() as i32);
    let left = Point::new((x - half).round() as i32, (y - height).round() as i32);
    let right = Point::new((x + half).round() as i32, (y - height).round() as i32);
    if tip == left || left == right {
        return;
    }
    draw_polygon_mut(frame, &[left, right, tip], color);
    let outline = Rgb([0, 0, 0]);
    for (p, q) in [(left, right), (right, tip), (tip, left)] {
        draw_line_segment_mut(frame, (p.x as f32, p.y as f32), (q.x as f32, q.y as f32), outline);
    }
}

/// Alpha-blend a solid rectangle, clipped to the frame.
fn blend_rect(frame: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>, alpha: f32) {
    let (fw, fh) = frame.dimensions();
    for py in y..(y + h).min(fh) {
        for px in x..(x + w).min(fw) {
            let pixel = frame.get_pixel_mut(px, py);
            for c in 0..3 {
                let v = color[c] as f32 * alpha + pixel[c] as f32 * (1.0 - alpha);
                pixel[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, ClassId};

    fn tracked(x: f32, class_id: ClassId, id: u32) -> Detection {
        Detection::new(BBox::new(x, 60.0, x + 30.0, 140.0), class_id, 0.9).with_tracker_id(id)
    }

    fn frame_detections() -> FrameDetections {
        FrameDetections {
            team1: DetectionSet::new(vec![tracked(40.0, ClassId::Team1, 1)]),
            team2: DetectionSet::new(vec![tracked(200.0, ClassId::Team2, 1)]),
            referees: DetectionSet::new(vec![Detection::new(
                BBox::new(120.0, 60.0, 150.0, 140.0),
                ClassId::Referee,
                0.8,
            )]),
            ..FrameDetections::default()
        }
    }

    #[test]
    fn test_labels_follow_detections() {
        let dets = frame_detections();
        let labels = Labels::for_frame(&dets);
        assert_eq!(labels.team1, vec!["1".to_string()]);
        assert_eq!(labels.referees, vec!["ref".to_string()]);
        assert!(labels.goalkeepers.is_empty());
        assert!(labels.get(Category::Ball).is_empty());
    }

    #[test]
    fn test_markers_use_category_colours() {
        let black = Rgb([0, 0, 0]);
        let mut frame = RgbImage::from_pixel(300, 200, black);
        let dets = frame_detections();
        let mut annotator = FrameAnnotator::without_font(&AnnotationConfig::default());
        annotator.annotate(&mut frame, &dets, &Labels::for_frame(&dets), &PossessionLedger::new());

        let painted = |color: &Rgb<u8>, xs: std::ops::Range<u32>| {
            xs.flat_map(|x| (125..160).map(move |y| (x, y)))
                .filter(|&(x, y)| frame.get_pixel(x, y) == color)
                .count()
        };
        // ellipses sit around the bottom edge of each box
        assert!(painted(&TEAM1_COLOR, 20..95) > 20);
        assert!(painted(&TEAM2_COLOR, 180..255) > 20);
        assert!(painted(&REFEREE_COLOR, 100..170) > 20);
        assert_eq!(painted(&TEAM2_COLOR, 20..95), 0);
        // top of the box stays untouched
        assert_eq!(frame.get_pixel(55, 60), &black);
    }

    #[test]
    fn test_scoreboard_panel_is_translucent_white() {
        let mut frame = RgbImage::from_pixel(300, 200, Rgb([0, 0, 0]));
        let mut annotator = FrameAnnotator::without_font(&AnnotationConfig::default());
        let mut ledger = PossessionLedger::new();
        ledger.record(Team::One);
        annotator.annotate(&mut frame, &FrameDetections::default(), &Labels::default(), &ledger);

        // 0.4 * 255 over black
        // panel spans x 194..293, y 7..31 on a 300x200 frame
        let panel_pixel = frame.get_pixel(288, 9);
        assert_eq!(panel_pixel, &Rgb([102, 102, 102]));
    }

    #[test]
    fn test_ball_and_active_triangles() {
        let mut frame = RgbImage::from_pixel(300, 200, Rgb([0, 0, 0]));
        let dets = FrameDetections {
            ball: DetectionSet::new(vec![Detection::new(
                BBox::new(140.0, 150.0, 160.0, 170.0),
                ClassId::Ball,
                0.7,
            )]),
            active_player: DetectionSet::new(vec![tracked(40.0, ClassId::ActivePlayer, 3)]),
            ..FrameDetections::default()
        };
        let mut annotator = FrameAnnotator::without_font(&AnnotationConfig::default());
        annotator.annotate(&mut frame, &dets, &Labels::default(), &PossessionLedger::new());

        // interior of the ball triangle, above bottom centre (150,170)
        assert_eq!(frame.get_pixel(150, 162), &BALL_COLOR);
        // interior of the active triangle, above top centre (55,60)
        assert_eq!(frame.get_pixel(55, 50), &ACTIVE_PLAYER_COLOR);
    }

    #[test]
    fn test_heatmap_keeps_bounded_history() {
        let config = AnnotationConfig {
            show_heatmap: true,
            heatmap_history: 2,
            ..AnnotationConfig::default()
        };
        let mut annotator = FrameAnnotator::without_font(&config);
        let dets = frame_detections();
        let mut frame = RgbImage::new(300, 200);
        for _ in 0..5 {
            annotator.annotate(&mut frame, &dets, &Labels::default(), &PossessionLedger::new());
        }
        let heatmap = annotator.heatmap().unwrap();
        assert_eq!(heatmap.team1().len(), 2);
        assert_eq!(heatmap.team2().len(), 2);
    }
}
