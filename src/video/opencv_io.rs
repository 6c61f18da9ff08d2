//! OpenCV videoio 后端
//! Reads and writes video files through `cv::VideoCapture` / `cv::VideoWriter`.

use std::path::Path;

use image::RgbImage;
use opencv::{
    core::{self, Mat, Scalar},
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use tracing::info;

use super::{Codec, FrameSink, FrameSource, VideoBackend, VideoInfo};
use crate::error::VideoError;

/// OpenCV 视频后端
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

impl OpenCvBackend {
    pub fn new() -> Self {
        Self
    }
}

impl VideoBackend for OpenCvBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        let open_err = |message: String| VideoError::OpenSource {
            path: path.to_path_buf(),
            message,
        };
        let file = path.to_str().ok_or_else(|| open_err("path is not valid UTF-8".to_string()))?;

        let cap = VideoCapture::from_file(file, videoio::CAP_ANY).map_err(|e| open_err(e.to_string()))?;
        if !cap.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("failed to open video file".to_string()));
        }

        let prop = |id: i32| cap.get(id).map_err(|e| open_err(e.to_string()));
        let fps = prop(videoio::CAP_PROP_FPS)?;
        let frame_count = prop(videoio::CAP_PROP_FRAME_COUNT)?;
        let width = prop(videoio::CAP_PROP_FRAME_WIDTH)?;
        let height = prop(videoio::CAP_PROP_FRAME_HEIGHT)?;

        let info = VideoInfo {
            width: width.max(0.0) as u32,
            height: height.max(0.0) as u32,
            fps,
            frame_count: frame_count.max(0.0) as u64,
        };
        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = info.frame_count,
            "video source opened"
        );

        Ok(Box::new(OpenCvSource { cap, info }))
    }

    fn open_sink(
        &self,
        path: &Path,
        codec: &Codec,
        info: &VideoInfo,
    ) -> Result<Box<dyn FrameSink>, VideoError> {
        let open_err = |message: String| VideoError::OpenSink {
            path: path.to_path_buf(),
            codec: codec.to_string(),
            message,
        };
        let file = path.to_str().ok_or_else(|| open_err("path is not valid UTF-8".to_string()))?;
        let [c1, c2, c3, c4] = codec
            .fourcc_chars()
            .ok_or_else(|| open_err(format!("invalid fourcc '{}'", codec.fourcc)))?;

        let fourcc = VideoWriter::fourcc(c1, c2, c3, c4).map_err(|e| open_err(e.to_string()))?;
        let writer = VideoWriter::new(
            file,
            fourcc,
            info.fps,
            core::Size::new(info.width as i32, info.height as i32),
            true,
        )
        .map_err(|e| open_err(e.to_string()))?;

        if !writer.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("encoder refused to open".to_string()));
        }

        Ok(Box::new(OpenCvSink {
            writer,
            width: info.width,
            height: info.height,
            released: false,
        }))
    }
}

struct OpenCvSource {
    cap: VideoCapture,
    info: VideoInfo,
}

impl FrameSource for OpenCvSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        let mut mat = Mat::default();
        let ok = self
            .cap
            .read(&mut mat)
            .map_err(|e| VideoError::Read(e.to_string()))?;
        if !ok || mat.empty() {
            return Ok(None);
        }
        bgr_mat_to_rgb(&mat).map(Some)
    }
}

struct OpenCvSink {
    writer: VideoWriter,
    width: u32,
    height: u32,
    released: bool,
}

impl FrameSink for OpenCvSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(VideoError::FrameSize {
                width: self.width,
                height: self.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }
        let mat = rgb_to_bgr_mat(frame)?;
        self.writer
            .write(&mat)
            .map_err(|e| VideoError::Write(e.to_string()))
    }

    fn release(&mut self) -> Result<(), VideoError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.writer
            .release()
            .map_err(|e| VideoError::Release(e.to_string()))
    }
}

// ========== 像素格式转换 ==========

/// BGR `CV_8UC3` Mat → RGB image
fn bgr_mat_to_rgb(mat: &Mat) -> Result<RgbImage, VideoError> {
    if mat.typ() != core::CV_8UC3 {
        return Err(VideoError::Read(format!("unsupported frame type {}", mat.typ())));
    }
    let (cols, rows) = (mat.cols() as u32, mat.rows() as u32);

    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone().map_err(|e| VideoError::Read(e.to_string()))?;
        &owned
    };
    let bgr = mat.data_bytes().map_err(|e| VideoError::Read(e.to_string()))?;

    let mut rgb = Vec::with_capacity(bgr.len());
    for px in bgr.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    RgbImage::from_raw(cols, rows, rgb)
        .ok_or_else(|| VideoError::Read("frame buffer size mismatch".to_string()))
}

/// RGB image → BGR `CV_8UC3` Mat
fn rgb_to_bgr_mat(frame: &RgbImage) -> Result<Mat, VideoError> {
    let mut mat = Mat::new_rows_cols_with_default(
        frame.height() as i32,
        frame.width() as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )
    .map_err(|e| VideoError::Write(e.to_string()))?;

    let dst = mat
        .data_bytes_mut()
        .map_err(|e| VideoError::Write(e.to_string()))?;
    for (d, s) in dst.chunks_exact_mut(3).zip(frame.as_raw().chunks_exact(3)) {
        d[0] = s[2];
        d[1] = s[1];
        d[2] = s[0];
    }
    Ok(mat)
}
