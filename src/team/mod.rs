/// 球队颜色分配 (Team Color Assigner)
///
/// 首帧拟合两队球衣颜色, 之后每帧按最近中心分类
/// - color:  HSV 转换与球衣颜色提取
/// - kmeans: 种子化聚类
pub mod color;
pub mod kmeans;

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::TeamConfig;
use crate::detection::types::{BBox, ClassId, DetectionSet};
use color::extract_player_color;
use kmeans::{KMeans, KMeansParams, Point};

/// 队伍
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Team {
    One,
    Two,
}

impl Team {
    pub const BOTH: [Team; 2] = [Team::One, Team::Two];

    pub fn from_index(idx: usize) -> Self {
        if idx == 0 {
            Team::One
        } else {
            Team::Two
        }
    }

    pub fn index(self) -> usize {
        match self {
            Team::One => 0,
            Team::Two => 1,
        }
    }

    pub fn class_id(self) -> ClassId {
        match self {
            Team::One => ClassId::Team1,
            Team::Two => ClassId::Team2,
        }
    }

    /// Key used in the statistics file.
    pub fn key(self) -> &'static str {
        match self {
            Team::One => "team1",
            Team::Two => "team2",
        }
    }
}

/// Two team centroids in HSV plus the clustering that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct TeamColorModel {
    kmeans: KMeans,
    from_defaults: bool,
}

impl TeamColorModel {
    /// Cluster per-player colours into two teams. Fewer than two samples
    /// yields the default prototypes.
    pub fn fit(colors: &[Point], config: &TeamConfig) -> Self {
        if colors.len() < 2 {
            return Self::defaults(config);
        }
        let params = KMeansParams::new(2, config.seed)
            .n_init(config.n_init)
            .max_iter(config.max_iter);
        match KMeans::fit(colors, &params) {
            Some(kmeans) => Self {
                kmeans,
                from_defaults: false,
            },
            None => Self::defaults(config),
        }
    }

    pub fn defaults(config: &TeamConfig) -> Self {
        Self {
            kmeans: KMeans::from_centroids(config.default_colors.to_vec()),
            from_defaults: true,
        }
    }

    pub fn centroid(&self, team: Team) -> Point {
        self.kmeans.centroids()[team.index()]
    }

    pub fn is_default(&self) -> bool {
        self.from_defaults
    }

    pub fn predict(&self, color: &Point) -> Team {
        Team::from_index(self.kmeans.predict(color))
    }
}

#[derive(Clone, Debug)]
enum AssignerState {
    Unfitted,
    Fitted(TeamColorModel),
}

/// 球队分配器: UNFITTED → FITTED, fit once then classify every frame
#[derive(Clone, Debug)]
pub struct TeamAssigner {
    config: TeamConfig,
    state: AssignerState,
}

impl TeamAssigner {
    pub fn new(config: TeamConfig) -> Self {
        Self {
            config,
            state: AssignerState::Unfitted,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, AssignerState::Fitted(_))
    }

    pub fn model(&self) -> Option<&TeamColorModel> {
        match &self.state {
            AssignerState::Fitted(model) => Some(model),
            AssignerState::Unfitted => None,
        }
    }

    /// Fit the team colours from the first frame that has players.
    ///
    /// Returns `None` and stays unfitted when `players` is empty. Once
    /// fitted the model is never replaced; later calls return it as is.
    pub fn fit(&mut self, frame: &RgbImage, players: &DetectionSet) -> Option<&TeamColorModel> {
        if let AssignerState::Unfitted = self.state {
            if players.is_empty() {
                return None;
            }

            let colors: Vec<Point> = players
                .iter()
                .filter_map(|d| extract_player_color(frame, &d.bbox, self.config.seed))
                .collect();

            let model = TeamColorModel::fit(&colors, &self.config);
            if model.is_default() {
                warn!(
                    players = players.len(),
                    colors = colors.len(),
                    "not enough player colours, using default team prototypes"
                );
            } else {
                info!(
                    players = players.len(),
                    team1 = ?model.centroid(Team::One),
                    team2 = ?model.centroid(Team::Two),
                    "team colours fitted"
                );
            }
            self.state = AssignerState::Fitted(model);
        }
        self.model()
    }

    /// Team of one player. Falls back to team 1 when unfitted or when no
    /// colour can be extracted.
    pub fn classify(&self, frame: &RgbImage, bbox: &BBox) -> Team {
        let AssignerState::Fitted(model) = &self.state else {
            debug!("classify called before fit, defaulting to team1");
            return Team::One;
        };
        match extract_player_color(frame, bbox, self.config.seed) {
            Some(color) => model.predict(&color),
            None => {
                warn!(?bbox, "could not determine player colour, defaulting to team1");
                Team::One
            }
        }
    }

    /// Split players into (team1, team2) sets relabelled with the team
    /// class, preserving detection order.
    pub fn partition(&self, frame: &RgbImage, players: &DetectionSet) -> (DetectionSet, DetectionSet) {
        let mut team1 = DetectionSet::empty();
        let mut team2 = DetectionSet::empty();
        for det in players {
            let team = self.classify(frame, &det.bbox);
            let mut det = det.clone();
            det.class_id = team.class_id();
            match team {
                Team::One => team1.push(det),
                Team::Two => team2.push(det),
            }
        }
        (team1, team2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::Detection;
    use image::Rgb;

    const GRASS: Rgb<u8> = Rgb([30, 150, 40]);
    const BLUE: Rgb<u8> = Rgb([20, 40, 220]);
    const RED: Rgb<u8> = Rgb([220, 20, 30]);

    fn paint_player(frame: &mut RgbImage, x: u32, y: u32, shirt: Rgb<u8>) -> Detection {
        for yy in y + 3..y + 20 {
            for xx in x + 5..x + 15 {
                frame.put_pixel(xx, yy, shirt);
            }
        }
        Detection::new(
            BBox::new(x as f32, y as f32, (x + 20) as f32, (y + 40) as f32),
            ClassId::Player,
            0.9,
        )
    }

    fn scene() -> (RgbImage, DetectionSet) {
        let mut frame = RgbImage::from_pixel(300, 100, GRASS);
        let players = DetectionSet::new(vec![
            paint_player(&mut frame, 10, 10, BLUE),
            paint_player(&mut frame, 60, 10, RED),
            paint_player(&mut frame, 110, 10, BLUE),
            paint_player(&mut frame, 160, 10, RED),
        ]);
        (frame, players)
    }

    #[test]
    fn test_fit_then_classify() {
        let (frame, players) = scene();
        let mut assigner = TeamAssigner::new(TeamConfig::default());
        assert!(!assigner.is_fitted());
        assert!(assigner.fit(&frame, &players).is_some());
        assert!(assigner.is_fitted());

        let (team1, team2) = assigner.partition(&frame, &players);
        assert_eq!(team1.len(), 2);
        assert_eq!(team2.len(), 2);
        let blue_team = assigner.classify(&frame, &players.as_slice()[0].bbox);
        assert_eq!(assigner.classify(&frame, &players.as_slice()[2].bbox), blue_team);
        assert_ne!(assigner.classify(&frame, &players.as_slice()[1].bbox), blue_team);
        assert!(team1.iter().all(|d| d.class_id == ClassId::Team1));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (frame, players) = scene();
        let mut a = TeamAssigner::new(TeamConfig::default());
        let mut b = TeamAssigner::new(TeamConfig::default());
        assert_eq!(a.fit(&frame, &players).cloned(), b.fit(&frame, &players).cloned());
    }

    #[test]
    fn test_empty_players_stay_unfitted() {
        let frame = RgbImage::from_pixel(50, 50, GRASS);
        let mut assigner = TeamAssigner::new(TeamConfig::default());
        assert!(assigner.fit(&frame, &DetectionSet::empty()).is_none());
        assert!(!assigner.is_fitted());
        assert_eq!(assigner.classify(&frame, &BBox::new(0.0, 0.0, 10.0, 10.0)), Team::One);
    }

    #[test]
    fn test_single_colour_falls_back_to_defaults() {
        let mut frame = RgbImage::from_pixel(100, 100, GRASS);
        let players = DetectionSet::new(vec![
            paint_player(&mut frame, 10, 10, BLUE),
            // zero-area box yields no colour
            Detection::new(BBox::new(50.0, 50.0, 50.0, 80.0), ClassId::Player, 0.9),
        ]);
        let mut assigner = TeamAssigner::new(TeamConfig::default());
        let model = assigner.fit(&frame, &players).cloned().unwrap();
        assert!(model.is_default());
        assert_eq!(model.centroid(Team::One), [100.0, 255.0, 255.0]);

        // invalid box classifies to team1 without failing
        assert_eq!(
            assigner.classify(&frame, &BBox::new(500.0, 500.0, 510.0, 510.0)),
            Team::One
        );
    }

    #[test]
    fn test_model_not_refit() {
        let (frame, players) = scene();
        let mut assigner = TeamAssigner::new(TeamConfig::default());
        let first = assigner.fit(&frame, &players).cloned();
        let other = RgbImage::from_pixel(300, 100, RED);
        let second = assigner.fit(&other, &players).cloned();
        assert_eq!(first, second);
    }
}
