/// 视频读写 (Video I/O)
///
/// 解码/编码后端抽象, 编码器回退列表与写帧线程
/// - opencv_io: 基于 OpenCV videoio 的后端 (feature `opencv`)
#[cfg(feature = "opencv")]
pub mod opencv_io;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, PipelineResult, VideoError};

#[cfg(feature = "opencv")]
pub use opencv_io::OpenCvBackend;

/// 视频流属性
#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// As reported by the container; may be 0 or approximate.
    pub frame_count: u64,
}

impl VideoInfo {
    pub fn duration_seconds(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Decoded frames, RGB, in presentation order.
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError>;
}

/// Encoder for annotated frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError>;

    /// Flush and close. Calling it more than once is allowed.
    fn release(&mut self) -> Result<(), VideoError>;
}

/// Factory for sources and sinks.
pub trait VideoBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError>;

    fn open_sink(
        &self,
        path: &Path,
        codec: &Codec,
        info: &VideoInfo,
    ) -> Result<Box<dyn FrameSink>, VideoError>;
}

// ========== 编码器 ==========

/// FourCC code and the container it is written into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    pub fourcc: String,
    pub container: String,
}

impl Codec {
    pub fn new(fourcc: &str, container: &str) -> Self {
        Self {
            fourcc: fourcc.to_string(),
            container: container.to_string(),
        }
    }

    /// Preferred order: browser friendly H.264 first, MSVC as last resort.
    pub fn preference_list() -> Vec<Codec> {
        vec![
            Codec::new("H264", "mp4"),
            Codec::new("avc1", "mp4"),
            Codec::new("mp4v", "mp4"),
            Codec::new("DIVX", "avi"),
            Codec::new("XVID", "avi"),
            Codec::new("MSVC", "avi"),
        ]
    }

    /// The four FourCC characters, `None` if the code is not 4 chars long.
    pub fn fourcc_chars(&self) -> Option<[char; 4]> {
        let chars: Vec<char> = self.fourcc.chars().collect();
        <[char; 4]>::try_from(chars).ok()
    }

    /// `path` with its extension replaced by this codec's container.
    pub fn output_path(&self, path: &Path) -> PathBuf {
        path.with_extension(&self.container)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fourcc, self.container)
    }
}

/// Sink that opened, with the path and codec actually used.
pub struct OpenedSink {
    pub sink: Box<dyn FrameSink>,
    pub path: PathBuf,
    pub codec: Codec,
}

impl fmt::Debug for OpenedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSink")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

/// Try each codec in order and keep the first sink that opens. The output
/// extension follows the container of that codec.
pub fn open_sink_with_fallback(
    backend: &dyn VideoBackend,
    requested: &Path,
    codecs: &[Codec],
    info: &VideoInfo,
) -> PipelineResult<OpenedSink> {
    let mut tried = Vec::with_capacity(codecs.len());
    for codec in codecs {
        let path = codec.output_path(requested);
        match backend.open_sink(&path, codec, info) {
            Ok(sink) => {
                info!(codec = %codec, path = %path.display(), "video writer opened");
                return Ok(OpenedSink {
                    sink,
                    path,
                    codec: codec.clone(),
                });
            }
            Err(e) => {
                warn!(codec = %codec, error = %e, "codec unavailable, trying next");
                // 打开失败的编码器可能已经建了空文件
                discard_file(&path, "removed file left by failed codec");
                tried.push(codec.to_string());
            }
        }
    }
    Err(AnalysisError::NoWritableCodec {
        path: requested.to_path_buf(),
        tried,
    })
}

// ========== 写帧线程 ==========

/// Moves encoding onto a writer thread behind a bounded queue. Frames are
/// written in submission order; the inner sink is released when the queue
/// closes.
pub struct ThreadedSink {
    tx: Option<Sender<RgbImage>>,
    handle: Option<JoinHandle<Result<u64, VideoError>>>,
}

impl ThreadedSink {
    pub fn spawn(mut inner: Box<dyn FrameSink>, queue: usize) -> Result<Self, VideoError> {
        let (tx, rx) = bounded::<RgbImage>(queue.max(1));
        let handle = thread::Builder::new()
            .name("frame-writer".to_string())
            .spawn(move || {
                let mut written = 0u64;
                let mut result = Ok(());
                for frame in rx.iter() {
                    if let Err(e) = inner.write_frame(&frame) {
                        result = Err(e);
                        break;
                    }
                    written += 1;
                }
                // 出错时也要释放编码器
                let released = inner.release();
                result.and(released).map(|_| written)
            })
            .map_err(|e| VideoError::Write(format!("failed to spawn writer thread: {}", e)))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn finish(&mut self) -> Result<(), VideoError> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => {
                let written = handle
                    .join()
                    .map_err(|_| VideoError::Write("writer thread panicked".to_string()))??;
                debug!(frames = written, "writer thread finished");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FrameSink for ThreadedSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(VideoError::Write("writer already released".to_string()));
        };
        if tx.send(frame.clone()).is_err() {
            // 写线程已退出, 取回它的错误
            return match self.finish() {
                Err(e) => Err(e),
                Ok(()) => Err(VideoError::Write("writer thread stopped".to_string())),
            };
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), VideoError> {
        self.finish()
    }
}

impl Drop for ThreadedSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "writer thread failed during drop");
        }
    }
}

// ========== 输出守卫 ==========

/// Owns the output sink for the whole run. Unless `commit` is called the
/// sink is released and the partial file deleted when the guard drops, so
/// every exit path closes the writer.
pub struct OutputGuard {
    sink: Option<Box<dyn FrameSink>>,
    path: PathBuf,
    codec: Codec,
    frames: u64,
}

impl OutputGuard {
    pub fn new(opened: OpenedSink) -> Self {
        Self {
            sink: Some(opened.sink),
            path: opened.path,
            codec: opened.codec,
            frames: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn write(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| VideoError::Write("output already closed".to_string()))?;
        sink.write_frame(frame)?;
        self.frames += 1;
        Ok(())
    }

    /// Release the sink and keep the file. If the release fails the file
    /// is removed and the error returned.
    pub fn commit(mut self) -> Result<PathBuf, VideoError> {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.release() {
                drop(sink);
                self.remove_partial();
                return Err(e);
            }
        }
        Ok(std::mem::take(&mut self.path))
    }

    fn remove_partial(&self) {
        discard_file(&self.path, "removed partial output video");
    }
}

fn discard_file(path: &Path, what: &str) {
    if !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "{}", what),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output file"),
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };
        if let Err(e) = sink.release() {
            warn!(error = %e, "failed to release video writer");
        }
        drop(sink);
        self.remove_partial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        frames: Vec<u8>,
        released: u32,
    }

    struct MemorySink {
        log: Arc<Mutex<Log>>,
        fail_after: Option<usize>,
    }

    impl FrameSink for MemorySink {
        fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
            let mut log = self.log.lock().unwrap();
            if Some(log.frames.len()) == self.fail_after {
                return Err(VideoError::Write("disk full".into()));
            }
            log.frames.push(frame.get_pixel(0, 0)[0]);
            Ok(())
        }

        fn release(&mut self) -> Result<(), VideoError> {
            self.log.lock().unwrap().released += 1;
            Ok(())
        }
    }

    /// Only opens codecs listed in `accept`, creating the file like a real
    /// encoder would.
    struct PickyBackend {
        accept: Vec<&'static str>,
        log: Arc<Mutex<Log>>,
        touch_on_failure: bool,
    }

    impl VideoBackend for PickyBackend {
        fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
            Err(VideoError::OpenSource {
                path: path.to_path_buf(),
                message: "not supported".into(),
            })
        }

        fn open_sink(
            &self,
            path: &Path,
            codec: &Codec,
            _info: &VideoInfo,
        ) -> Result<Box<dyn FrameSink>, VideoError> {
            if !self.accept.contains(&codec.fourcc.as_str()) {
                if self.touch_on_failure {
                    fs::write(path, b"").map_err(|e| VideoError::Write(e.to_string()))?;
                }
                return Err(VideoError::OpenSink {
                    path: path.to_path_buf(),
                    codec: codec.to_string(),
                    message: "encoder not found".into(),
                });
            }
            fs::write(path, b"").map_err(|e| VideoError::Write(e.to_string()))?;
            Ok(Box::new(MemorySink {
                log: self.log.clone(),
                fail_after: None,
            }))
        }
    }

    fn info() -> VideoInfo {
        VideoInfo {
            width: 4,
            height: 4,
            fps: 25.0,
            frame_count: 10,
        }
    }

    fn frame(v: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, image::Rgb([v, v, v]))
    }

    #[test]
    fn test_preference_order() {
        let labels: Vec<String> = Codec::preference_list().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            labels,
            ["H264/mp4", "avc1/mp4", "mp4v/mp4", "DIVX/avi", "XVID/avi", "MSVC/avi"]
        );
        assert_eq!(Codec::new("mp4v", "mp4").fourcc_chars(), Some(['m', 'p', '4', 'v']));
        assert_eq!(Codec::new("H26", "mp4").fourcc_chars(), None);
    }

    #[test]
    fn test_fallback_rewrites_extension() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PickyBackend {
            accept: vec!["XVID"],
            log: Arc::default(),
            touch_on_failure: false,
        };
        let requested = dir.path().join("result.mp4");
        let opened =
            open_sink_with_fallback(&backend, &requested, &Codec::preference_list(), &info())
                .unwrap();
        assert_eq!(opened.codec, Codec::new("XVID", "avi"));
        assert_eq!(opened.path, dir.path().join("result.avi"));
    }

    #[test]
    fn test_fallback_cleans_failed_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PickyBackend {
            accept: vec!["DIVX"],
            log: Arc::default(),
            touch_on_failure: true,
        };
        let requested = dir.path().join("result.mp4");
        let opened =
            open_sink_with_fallback(&backend, &requested, &Codec::preference_list(), &info())
                .unwrap();
        assert_eq!(opened.path, dir.path().join("result.avi"));
        assert!(opened.path.exists());
        assert!(!requested.exists());

        let backend = PickyBackend {
            accept: vec![],
            log: Arc::default(),
            touch_on_failure: true,
        };
        let requested = dir.path().join("nothing.mp4");
        assert!(
            open_sink_with_fallback(&backend, &requested, &Codec::preference_list(), &info())
                .is_err()
        );
        assert!(!requested.exists());
        assert!(!dir.path().join("nothing.avi").exists());
    }

    #[test]
    fn test_no_codec_opens() {
        let backend = PickyBackend {
            accept: vec![],
            log: Arc::default(),
            touch_on_failure: false,
        };
        let err = open_sink_with_fallback(
            &backend,
            Path::new("out.mp4"),
            &Codec::preference_list(),
            &info(),
        )
        .unwrap_err();
        match err {
            AnalysisError::NoWritableCodec { tried, .. } => assert_eq!(tried.len(), 6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_threaded_sink_preserves_order() {
        let log = Arc::new(Mutex::new(Log::default()));
        let inner = Box::new(MemorySink {
            log: log.clone(),
            fail_after: None,
        });
        let mut sink = ThreadedSink::spawn(inner, 2).unwrap();
        for v in 0..20u8 {
            sink.write_frame(&frame(v)).unwrap();
        }
        sink.release().unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.frames, (0..20u8).collect::<Vec<_>>());
        assert_eq!(log.released, 1);
    }

    #[test]
    fn test_threaded_sink_reports_write_error() {
        let log = Arc::new(Mutex::new(Log::default()));
        let inner = Box::new(MemorySink {
            log: log.clone(),
            fail_after: Some(3),
        });
        let mut sink = ThreadedSink::spawn(inner, 1).unwrap();
        let mut failed = false;
        for v in 0..50u8 {
            if sink.write_frame(&frame(v)).is_err() {
                failed = true;
                break;
            }
        }
        let released = sink.release();
        assert!(failed || released.is_err());
        assert_eq!(log.lock().unwrap().released, 1);
    }

    #[test]
    fn test_guard_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = PickyBackend {
            accept: vec!["H264"],
            log: log.clone(),
            touch_on_failure: false,
        };
        let requested = dir.path().join("partial.mp4");
        let opened =
            open_sink_with_fallback(&backend, &requested, &Codec::preference_list(), &info())
                .unwrap();
        let mut guard = OutputGuard::new(opened);
        guard.write(&frame(1)).unwrap();
        assert!(requested.exists());
        drop(guard);
        assert!(!requested.exists());
        assert_eq!(log.lock().unwrap().released, 1);
    }

    #[test]
    fn test_guard_commit_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = PickyBackend {
            accept: vec!["mp4v"],
            log: log.clone(),
            touch_on_failure: false,
        };
        let opened = open_sink_with_fallback(
            &backend,
            &dir.path().join("done.mp4"),
            &Codec::preference_list(),
            &info(),
        )
        .unwrap();
        let mut guard = OutputGuard::new(opened);
        guard.write(&frame(1)).unwrap();
        assert_eq!(guard.frames_written(), 1);
        let path = guard.commit().unwrap();
        assert!(path.exists());
        assert_eq!(log.lock().unwrap().released, 1);
    }
}
