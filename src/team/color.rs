//! 球衣颜色提取
//! Jersey colour extraction in OpenCV's 8-bit HSV space (H in 0..180).

use image::RgbImage;
use tracing::debug;

use super::kmeans::{KMeans, KMeansParams, Point};
use crate::detection::types::BBox;

/// RGB → HSV with OpenCV 8-bit ranges: H ∈ [0,180), S,V ∈ [0,255].
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> Point {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v > 0.0 { diff * 255.0 / v } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    [h / 2.0, s, v]
}

/// Integer pixel rectangle of `bbox` clipped to the frame, `None` if empty.
pub fn clip_to_frame(bbox: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if !bbox.is_well_formed() {
        return None;
    }
    let x1 = (bbox.x1.max(0.0) as u32).min(width);
    let y1 = (bbox.y1.max(0.0) as u32).min(height);
    let x2 = (bbox.x2.max(0.0) as u32).min(width);
    let y2 = (bbox.y2.max(0.0) as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

/// Representative jersey colour of one player.
///
/// Clusters the top half of the box into two colours, treats the cluster
/// that owns most of the region's corners as background and returns the
/// other centroid. Returns `None` for boxes that yield no pixels.
pub fn extract_player_color(frame: &RgbImage, bbox: &BBox, seed: u64) -> Option<Point> {
    let Some((x, y, w, h)) = clip_to_frame(bbox, frame.width(), frame.height()) else {
        debug!(?bbox, "player box outside frame, no colour");
        return None;
    };

    // 上半身 (避开草地); 太矮时退回整个框
    let top_h = if h / 2 > 0 { h / 2 } else { h };

    let mut pixels = Vec::with_capacity((w * top_h) as usize);
    for row in y..y + top_h {
        for col in x..x + w {
            let p = frame.get_pixel(col, row);
            pixels.push(rgb_to_hsv(p[0], p[1], p[2]));
        }
    }

    let kmeans = KMeans::fit(&pixels, &KMeansParams::new(2, seed))?;
    let labels = kmeans.labels();
    let (w, top_h) = (w as usize, top_h as usize);
    let corners = [
        labels[0],
        labels[w - 1],
        labels[(top_h - 1) * w],
        labels[top_h * w - 1],
    ];

    let player = 1 - background_label(corners);
    kmeans.centroids().get(player).copied()
}

/// 角点多数票为背景簇; 2:2 平局时取簇 0
fn background_label(corners: [usize; 4]) -> usize {
    let ones = corners.iter().filter(|&&l| l == 1).count();
    if ones > 2 {
        1
    } else {
        0
    }
}
