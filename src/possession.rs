//! 控球判定
//! Ball possession: which tracked player holds the ball each frame, and the
//! per-team frame tally.

use tracing::trace;

use crate::config::PossessionConfig;
use crate::detection::types::{ClassId, Detection, DetectionSet};
use crate::team::Team;

/// Running per-team count of frames in possession.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PossessionLedger {
    counts: [u64; 2],
    last_team: Option<Team>,
}

impl PossessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, team: Team) {
        self.counts[team.index()] += 1;
        self.last_team = Some(team);
    }

    pub fn count(&self, team: Team) -> u64 {
        self.counts[team.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn last_team(&self) -> Option<Team> {
        self.last_team
    }

    /// Share of possession in percent, denominator floored at 1.
    pub fn percent(&self, team: Team) -> f64 {
        self.count(team) as f64 / self.total().max(1) as f64 * 100.0
    }

    /// Share in `[0, 1]`, as drawn on the scoreboard.
    pub fn fraction(&self, team: Team) -> f64 {
        self.count(team) as f64 / self.total().max(1) as f64
    }
}

/// How possession was decided for one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum PossessionSource {
    /// A player was close enough to the ball
    Player,
    /// Ball missing or unclaimed, previous holder keeps it
    CarriedForward,
    /// Nobody has had the ball yet
    None,
}

/// 单帧控球结果
#[derive(Clone, Debug, PartialEq)]
pub struct FrameOutcome {
    pub team: Option<Team>,
    pub source: PossessionSource,
    /// The ball holder, relabelled `ActivePlayer` and padded for display
    pub active_player: Option<Detection>,
}

/// 控球判定器
#[derive(Clone, Debug)]
pub struct PossessionResolver {
    config: PossessionConfig,
    ledger: PossessionLedger,
}

impl PossessionResolver {
    pub fn new(config: PossessionConfig) -> Self {
        Self {
            config,
            ledger: PossessionLedger::new(),
        }
    }

    pub fn ledger(&self) -> &PossessionLedger {
        &self.ledger
    }

    /// Resolve one frame. `players` are the merged tracked team sets
    /// (`Team1`/`Team2` classes), `balls` the ball detections of the frame.
    pub fn resolve(&mut self, players: &DetectionSet, balls: &DetectionSet) -> FrameOutcome {
        let holder = pick_ball(balls).and_then(|ball| {
            let (bx, by) = ball.bbox.center();
            closest_player(players, bx, by, self.config.max_ball_distance)
        });

        if let Some(player) = holder {
            if let Some(team) = team_of(players, player) {
                self.ledger.record(team);
                let mut active = player.clone();
                active.class_id = ClassId::ActivePlayer;
                active.bbox = active.bbox.pad(self.config.highlight_padding);
                trace!(team = team.key(), tracker_id = ?player.tracker_id, "possession");
                return FrameOutcome {
                    team: Some(team),
                    source: PossessionSource::Player,
                    active_player: Some(active),
                };
            }
        }

        match self.ledger.last_team() {
            Some(team) => {
                self.ledger.record(team);
                FrameOutcome {
                    team: Some(team),
                    source: PossessionSource::CarriedForward,
                    active_player: None,
                }
            }
            None => FrameOutcome {
                team: None,
                source: PossessionSource::None,
                active_player: None,
            },
        }
    }
}

/// Highest-confidence ball, first one on ties.
fn pick_ball(balls: &DetectionSet) -> Option<&Detection> {
    balls.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.confidence >= d.confidence => Some(b),
        _ => Some(d),
    })
}

/// Distance from a point to the nearer foot (bottom corner) of a box.
fn foot_distance(det: &Detection, x: f32, y: f32) -> f32 {
    let left = (det.bbox.x1 - x).hypot(det.bbox.y2 - y);
    let right = (det.bbox.x2 - x).hypot(det.bbox.y2 - y);
    left.min(right)
}

/// Nearest tracked player within `max_distance`. Exact ties go to the lower
/// tracker id, then to team1.
fn closest_player(players: &DetectionSet, x: f32, y: f32, max_distance: f32) -> Option<&Detection> {
    let rank = |d: &Detection| {
        let team_rank = if d.class_id == ClassId::Team1 { 0 } else { 1 };
        (d.tracker_id.unwrap_or(u32::MAX), team_rank)
    };

    let mut best: Option<(&Detection, f32)> = None;
    for det in players.iter().filter(|d| d.tracker_id.is_some()) {
        let dist = foot_distance(det, x, y);
        if !dist.is_finite() || dist > max_distance {
            continue;
        }
        best = match best {
            Some((b, bd)) if bd < dist || (bd == dist && rank(b) <= rank(det)) => Some((b, bd)),
            _ => Some((det, dist)),
        };
    }
    best.map(|(d, _)| d)
}

/// Team owning the player, by membership of (class, tracker id) in each
/// team's currently tracked ids; team1 is checked first.
fn team_of(players: &DetectionSet, player: &Detection) -> Option<Team> {
    let id = player.tracker_id?;
    Team::BOTH.into_iter().find(|team| {
        player.class_id == team.class_id()
            && players
                .iter()
                .any(|d| d.class_id == team.class_id() && d.tracker_id == Some(id))
    })
}
