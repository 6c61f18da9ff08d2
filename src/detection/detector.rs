// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测器 (Detector)
// YOLOv8 ONNX 模型: 加载、预处理、推理、后处理

use std::error::Error;
use std::path::Path;

use fast_image_resize as fr;
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info, trace, warn};

use super::types::{BBox, ClassId, Detection, DetectionSet};
use crate::config::{DetectorConfig, Device};
use crate::error::{AnalysisError, InputKind, PipelineResult};

/// Error type returned by a detector call.
pub type DetectError = Box<dyn Error + Send + Sync>;

/// Frame in, detections out. Called once per frame, synchronously.
pub trait Detector: Send {
    /// Detections in source-frame coordinates, with class ids from the
    /// fixed taxonomy and confidence at or above the configured threshold.
    fn detect(&mut self, frame: &RgbImage) -> Result<DetectionSet, DetectError>;

    /// Class names in model id order.
    fn class_names(&self) -> &[String];

    /// Model identifier written to the statistics record.
    fn model_name(&self) -> &str;
}

/// Check a detector's class names before the first frame is read.
pub fn validate_detector(detector: &dyn Detector) -> PipelineResult<()> {
    ClassId::validate_detector_names(detector.class_names()).map_err(AnalysisError::config)
}

/// YOLOv8 ONNX 检测器
pub struct OnnxDetector {
    session: Session,
    config: DetectorConfig,
    names: Vec<String>,
    model_name: String,
}

impl OnnxDetector {
    pub fn new(path: impl AsRef<Path>, config: &DetectorConfig) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AnalysisError::input_missing(InputKind::Model, path));
        }
        let bytes = std::fs::read(path)?;
        let session = create_session(&bytes, config.device)?;

        let names = match &config.class_names {
            Some(names) => names.clone(),
            None => metadata_names(&session).ok_or_else(|| {
                AnalysisError::config(
                    "model metadata has no class names, set detector.class_names",
                )
            })?,
        };
        ClassId::validate_detector_names(&names).map_err(AnalysisError::config)?;

        let model_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            model = %model_name,
            classes = ?names,
            input_size = config.input_size,
            conf = config.confidence_threshold,
            "✅ YOLOv8 检测模型加载成功"
        );

        Ok(Self {
            session,
            config: config.clone(),
            names,
            model_name,
        })
    }

    fn infer(&mut self, input: Vec<f32>) -> Result<(Vec<usize>, Vec<f32>), DetectError> {
        let size = self.config.input_size as usize;
        let input: Value = Value::from(Tensor::from_array((
            vec![1usize, 3, size, size],
            input.into_boxed_slice(),
        ))?);
        let outputs = self.session.run(ort::inputs![input])?;
        let output = outputs.get("output0").ok_or("model has no output0 tensor")?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<DetectionSet, DetectError> {
        let t_pre = std::time::Instant::now();
        let (input, ratio) = letterbox(frame, self.config.input_size)?;
        trace!(elapsed = ?t_pre.elapsed(), "preprocess");

        let t_run = std::time::Instant::now();
        let (dims, output) = self.infer(input)?;
        trace!(elapsed = ?t_run.elapsed(), "inference");

        let detections = decode_output(
            &dims,
            &output,
            ratio,
            frame.width() as f32,
            frame.height() as f32,
            self.config.confidence_threshold,
        )?;
        Ok(per_class_nms(&detections, self.config.nms_iou_threshold))
    }

    fn class_names(&self) -> &[String] {
        &self.names
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn create_session(bytes: &[u8], device: Device) -> PipelineResult<Session> {
    let builder = Session::builder()
        .map_err(|e| AnalysisError::model_load(format!("failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| AnalysisError::model_load(format!("failed to set optimization level: {}", e)))?;

    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if device != Device::Cpu {
            if let Ok(cuda_builder) = builder
                .clone()
                .with_execution_providers([CUDAExecutionProvider::default().build()])
            {
                match cuda_builder.commit_from_memory(bytes) {
                    Ok(session) => {
                        info!("Using CUDA execution provider");
                        return Ok(session);
                    }
                    Err(e) if device == Device::Cuda => {
                        return Err(AnalysisError::model_load(format!("CUDA unavailable: {}", e)));
                    }
                    Err(e) => debug!(error = %e, "CUDA execution provider not available"),
                }
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        if device == Device::Cuda {
            warn!("built without the `cuda` feature, falling back to CPU");
        }
    }

    info!("Using CPU execution provider");
    builder
        .commit_from_memory(bytes)
        .map_err(|e| AnalysisError::model_load(e.to_string()))
}

/// Class names from the Ultralytics `names` metadata entry,
/// e.g. `{0: 'ball', 1: 'goalkeeper', 2: 'player', 3: 'referee'}`.
fn metadata_names(session: &Session) -> Option<Vec<String>> {
    let metadata = session.metadata().ok()?;
    let raw = metadata.custom("names").ok()??;
    parse_names(&raw)
}

fn parse_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
    let mut entries = Vec::new();
    for entry in body.split(',').filter(|e| !e.trim().is_empty()) {
        let (id, name) = entry.split_once(':')?;
        let id: usize = id.trim().parse().ok()?;
        let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
        entries.push((id, name.to_string()));
    }
    entries.sort_by_key(|(id, _)| *id);
    if entries.is_empty() || entries.iter().enumerate().any(|(i, (id, _))| i != *id) {
        return None;
    }
    Some(entries.into_iter().map(|(_, name)| name).collect())
}

// ========== 预处理 ==========

/// Resize keeping aspect ratio into the top-left of a `size`x`size` canvas
/// and lay it out as NCHW floats in `[0, 1]`. Returns the tensor data and
/// the scale ratio.
fn letterbox(frame: &RgbImage, size: u32) -> Result<(Vec<f32>, f32), DetectError> {
    let (w0, h0) = frame.dimensions();
    if w0 == 0 || h0 == 0 {
        return Err("empty frame".into());
    }
    let ratio = (size as f32 / w0 as f32).min(size as f32 / h0 as f32);
    let w_new = ((w0 as f32 * ratio).round() as u32).clamp(1, size);
    let h_new = ((h0 as f32 * ratio).round() as u32).clamp(1, size);

    let src = fr::images::Image::from_vec_u8(w0, h0, frame.as_raw().clone(), fr::PixelType::U8x3)?;
    let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
    let mut resizer = fr::Resizer::new();
    resizer.resize(
        &src,
        &mut dst,
        &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
    )?;

    let plane = (size * size) as usize;
    let mut ys = vec![144.0 / 255.0; 3 * plane];
    for (i, px) in dst.buffer().chunks_exact(3).enumerate() {
        let x = i % w_new as usize;
        let y = i / w_new as usize;
        let offset = y * size as usize + x;
        ys[offset] = px[0] as f32 / 255.0;
        ys[plane + offset] = px[1] as f32 / 255.0;
        ys[2 * plane + offset] = px[2] as f32 / 255.0;
    }
    Ok((ys, ratio))
}

// ========== 后处理 ==========

/// Decode a YOLOv8 head `[1, 4 + nc, anchors]` (cx, cy, w, h, class scores).
fn decode_output(
    dims: &[usize],
    output: &[f32],
    ratio: f32,
    width: f32,
    height: f32,
    conf: f32,
) -> Result<DetectionSet, DetectError> {
    const CXYWH_OFFSET: usize = 4;
    let (features, anchors) = match dims {
        [1, f, a] if *f > CXYWH_OFFSET => (*f, *a),
        other => return Err(format!("unexpected output shape {:?}", other).into()),
    };
    if output.len() != features * anchors {
        return Err(format!(
            "output has {} values, shape says {}",
            output.len(),
            features * anchors
        )
        .into());
    }
    let at = |feature: usize, anchor: usize| output[feature * anchors + anchor];

    let mut detections = DetectionSet::empty();
    for i in 0..anchors {
        let (id, confidence) = (CXYWH_OFFSET..features)
            .map(|f| (f - CXYWH_OFFSET, at(f, i)))
            .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
        if confidence < conf {
            continue;
        }
        let Some(class_id) = ClassId::from_id(id as u32).filter(|c| ClassId::DETECTOR_CLASSES.contains(c)) else {
            trace!(class = id, "detection with unmapped class skipped");
            continue;
        };

        let cx = at(0, i) / ratio;
        let cy = at(1, i) / ratio;
        let w = at(2, i) / ratio;
        let h = at(3, i) / ratio;
        let bbox = BBox::new(
            (cx - w / 2.0).clamp(0.0, width),
            (cy - h / 2.0).clamp(0.0, height),
            (cx + w / 2.0).clamp(0.0, width),
            (cy + h / 2.0).clamp(0.0, height),
        );
        if bbox.area() <= 0.0 {
            continue;
        }
        detections.push(Detection::new(bbox, class_id, confidence));
    }
    Ok(detections)
}

/// NMS within each detector class, result grouped by class id.
fn per_class_nms(detections: &DetectionSet, iou: f32) -> DetectionSet {
    ClassId::DETECTOR_CLASSES
        .iter()
        .flat_map(|&class| detections.filter_class(class).with_nms(iou).into_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a `[1, 8, n]` head from (cx, cy, w, h, class, score) rows.
    fn head(rows: &[(f32, f32, f32, f32, usize, f32)]) -> (Vec<usize>, Vec<f32>) {
        let n = rows.len();
        let mut out = vec![0.0; 8 * n];
        for (i, &(cx, cy, w, h, class, score)) in rows.iter().enumerate() {
            out[i] = cx;
            out[n + i] = cy;
            out[2 * n + i] = w;
            out[3 * n + i] = h;
            out[(4 + class) * n + i] = score;
        }
        (vec![1, 8, n], out)
    }

    #[test]
    fn test_parse_names() {
        let names = parse_names("{0: 'ball', 1: 'goalkeeper', 2: 'player', 3: 'referee'}").unwrap();
        assert_eq!(names, ["ball", "goalkeeper", "player", "referee"]);
        assert!(parse_names("{1: 'ball'}").is_none());
        assert!(parse_names("garbage").is_none());
    }

    #[test]
    fn test_decode_thresholds_and_unscales() {
        let (dims, out) = head(&[
            (100.0, 100.0, 20.0, 40.0, 2, 0.9),
            (300.0, 300.0, 10.0, 10.0, 0, 0.2),
        ]);
        let set = decode_output(&dims, &out, 0.5, 1280.0, 720.0, 0.3).unwrap();
        assert_eq!(set.len(), 1);
        let det = set.get(0).unwrap();
        assert_eq!(det.class_id, ClassId::Player);
        assert_eq!(det.bbox, BBox::new(180.0, 160.0, 220.0, 240.0));
        assert!(det.tracker_id.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        assert!(decode_output(&[1, 3, 2], &[0.0; 6], 1.0, 10.0, 10.0, 0.3).is_err());
        assert!(decode_output(&[1, 8, 2], &[0.0; 10], 1.0, 10.0, 10.0, 0.3).is_err());
    }

    #[test]
    fn test_per_class_nms_keeps_other_classes() {
        let (dims, out) = head(&[
            (50.0, 50.0, 20.0, 20.0, 2, 0.9),
            (51.0, 51.0, 20.0, 20.0, 2, 0.8),
            (50.0, 50.0, 20.0, 20.0, 3, 0.7),
        ]);
        let set = decode_output(&dims, &out, 1.0, 200.0, 200.0, 0.3).unwrap();
        let set = per_class_nms(&set, 0.45);
        assert_eq!(set.len(), 2);
        assert_eq!(set.filter_class(ClassId::Player).len(), 1);
        assert_eq!(set.filter_class(ClassId::Referee).len(), 1);
    }

    #[test]
    fn test_letterbox_layout() {
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 0]));
        let (ys, ratio) = letterbox(&frame, 32).unwrap();
        assert_eq!(ratio, 0.5);
        assert_eq!(ys.len(), 3 * 32 * 32);
        // image occupies the top 16 rows
        assert!((ys[0] - 1.0).abs() < 1e-3);
        assert!(ys[32 * 32].abs() < 1e-3);
        // padding below
        assert!((ys[20 * 32] - 144.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_is_input_missing() {
        let err = OnnxDetector::new("/nonexistent/best.onnx", &DetectorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, AnalysisError::InputMissing { kind: InputKind::Model, .. }));
    }
}
