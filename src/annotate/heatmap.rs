//! 热力图
//! Bounded per-team position history and the heatmap overlay drawn from it.

use std::collections::VecDeque;

use image::{Rgb, RgbImage};

use crate::detection::types::DetectionSet;

/// Gaussian splat radius in pixels
const SPLAT_RADIUS: i32 = 30;

/// Ring buffer of the most recent `capacity` positions.
#[derive(Clone, Debug)]
pub struct PositionHistory {
    capacity: usize,
    points: VecDeque<(f32, f32)>,
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            points: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, point: (f32, f32)) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Record the centre of every detection in order.
    pub fn record(&mut self, detections: &DetectionSet) {
        for det in detections {
            self.push(det.bbox.center());
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f32, f32)> + '_ {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// 球员位置热力图
#[derive(Clone, Debug)]
pub struct Heatmap {
    team1: PositionHistory,
    team2: PositionHistory,
    opacity: f32,
    kernel: Vec<f32>,
}

impl Heatmap {
    pub fn new(capacity: usize, opacity: f32) -> Self {
        Self {
            team1: PositionHistory::new(capacity),
            team2: PositionHistory::new(capacity),
            opacity: opacity.clamp(0.0, 1.0),
            kernel: gaussian_kernel(SPLAT_RADIUS),
        }
    }

    pub fn record(&mut self, team1: &DetectionSet, team2: &DetectionSet) {
        self.team1.record(team1);
        self.team2.record(team2);
    }

    pub fn team1(&self) -> &PositionHistory {
        &self.team1
    }

    pub fn team2(&self) -> &PositionHistory {
        &self.team2
    }

    /// Accumulated, min-max normalised intensity in `[0, 1]`, row major.
    /// `None` while no position falls inside the frame.
    pub fn intensity(&self, width: u32, height: u32) -> Option<Vec<f32>> {
        let (w, h) = (width as i32, height as i32);
        let size = 2 * SPLAT_RADIUS + 1;
        let mut acc = vec![0.0f32; (width * height) as usize];
        let mut any = false;

        for &(px, py) in self.team1.iter().chain(self.team2.iter()) {
            let (cx, cy) = (px as i32, py as i32);
            if px < 0.0 || py < 0.0 || cx >= w || cy >= h {
                continue;
            }
            any = true;
            for ky in 0..size {
                let y = cy + ky - SPLAT_RADIUS;
                if y < 0 || y >= h {
                    continue;
                }
                for kx in 0..size {
                    let x = cx + kx - SPLAT_RADIUS;
                    if x < 0 || x >= w {
                        continue;
                    }
                    acc[(y * w + x) as usize] += self.kernel[(ky * size + kx) as usize];
                }
            }
        }
        if !any {
            return None;
        }

        let (min, max) = acc
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;
        if range > 0.0 {
            for v in &mut acc {
                *v = (*v - min) / range;
            }
        }
        Some(acc)
    }

    /// Blend the JET-coloured heatmap over the whole frame.
    pub fn render(&self, frame: &mut RgbImage) {
        let (width, height) = frame.dimensions();
        let Some(intensity) = self.intensity(width, height) else {
            return;
        };
        let a = self.opacity;
        for (pixel, v) in frame.pixels_mut().zip(intensity) {
            let heat = jet((v * 255.0).round() / 255.0);
            for c in 0..3 {
                let blended = pixel[c] as f32 * (1.0 - a) + heat[c] as f32 * a;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn gaussian_kernel(radius: i32) -> Vec<f32> {
    let sigma = radius as f32 / 2.0;
    let denom = 2.0 * sigma * sigma;
    let mut kernel = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for y in -radius..=radius {
        for x in -radius..=radius {
            kernel.push((-((x * x + y * y) as f32) / denom).exp());
        }
    }
    kernel
}

/// JET colour map, `v` in `[0, 1]` from blue through green to red.
pub fn jet(v: f32) -> Rgb<u8> {
    let v = v.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, ClassId, Detection};

    #[test]
    fn test_history_is_bounded() {
        let mut history = PositionHistory::new(3);
        for i in 0..5 {
            history.push((i as f32, 0.0));
        }
        assert_eq!(history.len(), 3);
        let xs: Vec<f32> = history.iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
    }

    #[test]
    fn test_intensity_peaks_at_position() {
        let mut heatmap = Heatmap::new(200, 0.4);
        let team1 = DetectionSet::new(vec![Detection::new(
            BBox::new(40.0, 40.0, 60.0, 60.0),
            ClassId::Team1,
            0.9,
        )]);
        heatmap.record(&team1, &DetectionSet::empty());
        let intensity = heatmap.intensity(100, 100).unwrap();
        assert_eq!(intensity[50 * 100 + 50], 1.0);
        assert_eq!(intensity[0], 0.0);
    }

    #[test]
    fn test_render_without_positions_is_noop() {
        let heatmap = Heatmap::new(10, 0.4);
        let mut frame = RgbImage::from_pixel(20, 20, Rgb([10, 20, 30]));
        heatmap.render(&mut frame);
        assert_eq!(frame.get_pixel(5, 5), &Rgb([10, 20, 30]));
    }
}
