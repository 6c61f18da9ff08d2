//! 多目标跟踪公共组件
//! Common components for multi-object tracking

use super::types::{BBox, DetectionSet};

// ========== 卡尔曼滤波器 ==========

/// 单坐标的匀速模型: 位置 + 速度, 协方差 [[pp, pv], [pv, vv]]
#[derive(Clone, Copy, Debug)]
struct Axis {
    pos: f32,
    vel: f32,
    pp: f32,
    pv: f32,
    vv: f32,
}

impl Axis {
    fn new(pos: f32) -> Self {
        // 初始速度未知, 速度方差取大
        Self {
            pos,
            vel: 0.0,
            pp: 10.0,
            pv: 0.0,
            vv: 100.0,
        }
    }

    /// x' = F x, P' = F P Fᵀ + Q, F = [[1, 1], [0, 1]]
    fn predict(&mut self, q: f32, damping: f32) {
        self.pos += self.vel;
        self.vel *= damping;
        self.pp += 2.0 * self.pv + self.vv + q;
        self.pv = (self.pv + self.vv) * damping;
        self.vv = self.vv * damping * damping + q;
    }

    /// 观测只有位置, H = [1, 0]
    fn correct(&mut self, measured: f32, r: f32) {
        let residual = measured - self.pos;
        let s = self.pp + r;
        let k_pos = self.pp / s;
        let k_vel = self.pv / s;

        self.pos += k_pos * residual;
        self.vel += k_vel * residual;

        let (pp, pv) = (self.pp, self.pv);
        self.pp = (1.0 - k_pos) * pp;
        self.pv = (1.0 - k_pos) * pv;
        self.vv -= k_vel * pv;
    }
}

/// 边界框卡尔曼滤波 (cx, cy, w, h 各自独立的匀速模型)
///
/// Size velocities are damped each frame so a box does not keep growing
/// once its detections stop changing scale.
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    axes: [Axis; 4],
    /// 过程噪声
    q: f32,
    /// 观测噪声
    r: f32,
}

const CENTER_DAMPING: f32 = 1.0;
const SIZE_DAMPING: f32 = 0.9;

impl KalmanBoxFilter {
    /// `q`: process noise, `r`: measurement noise (bigger trusts the prediction more).
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            axes: [
                Axis::new(cx),
                Axis::new(cy),
                Axis::new(bbox.width()),
                Axis::new(bbox.height()),
            ],
            q,
            r,
        }
    }

    pub fn predict(&mut self) {
        for (i, axis) in self.axes.iter_mut().enumerate() {
            let damping = if i < 2 { CENTER_DAMPING } else { SIZE_DAMPING };
            axis.predict(self.q, damping);
        }
    }

    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let measured = [cx, cy, bbox.width(), bbox.height()];
        for (axis, z) in self.axes.iter_mut().zip(measured) {
            axis.correct(z, self.r);
        }
    }

    /// 当前估计的边界框
    pub fn state_bbox(&self) -> BBox {
        let [cx, cy, w, h] = self.axes.map(|a| a.pos);
        box_from_center(cx, cy, w, h)
    }

}

fn box_from_center(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    let half_w = w.max(1.0) / 2.0;
    let half_h = h.max(1.0) / 2.0;
    BBox::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
}

// ========== 跟踪器统一接口 ==========

/// 多目标跟踪器 Trait
pub trait Tracker {
    /// Feed one frame of detections; returns the detections that belong to a
    /// live track, each carrying its `tracker_id`, in input order.
    fn update(&mut self, detections: &DetectionSet) -> DetectionSet;

    /// 重置跟踪器 (清除所有跟踪)
    fn reset(&mut self);

    /// 获取当前跟踪数量
    fn track_count(&self) -> usize;
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    bbox1.iou(bbox2)
}
