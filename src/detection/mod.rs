/// 检测系统 (Detection System)
///
/// 目标检测与按队跟踪
/// - types:     类别表、检测框、检测集合
/// - detector:  YOLOv8 ONNX 检测器
/// - tracker:   卡尔曼滤波 + 跟踪器接口
/// - bytetrack: ByteTrack (每队一个实例)
pub mod bytetrack;
pub mod detector;
pub mod tracker;
pub mod types;

pub use bytetrack::ByteTracker;
pub use detector::{validate_detector, DetectError, Detector, OnnxDetector};
pub use tracker::{compute_iou, KalmanBoxFilter, Tracker};
pub use types::{BBox, ClassId, Detection, DetectionSet, MalformedDetection};
