use opencv::{core::Mat, prelude::*, videoio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Video source {0} is not open")]
    Unavailable(String),
    #[error("OpenCV error while opening video source: {0}")]
    OpenFailed(opencv::Error),
    #[error("Failed to read frame: {0}")]
    Read(opencv::Error),
    #[error("Video source returned no frame")]
    EndOfStream,
    #[error("Video source has been released")]
    Released,
}

/// The decoder seam. `videoio::VideoCapture` is the production backend.
pub trait VideoBackend: Send {
    /// Index of the next frame to be read.
    fn position(&self) -> Result<f64, SourceError>;
    /// Total frame count, or a non-positive value when the source cannot tell.
    fn frame_count(&self) -> Result<f64, SourceError>;
    fn rewind(&mut self) -> Result<(), SourceError>;
    fn read(&mut self, frame: &mut Mat) -> Result<bool, SourceError>;
    /// Frame dimensions as `(width, height)`, when known.
    fn frame_size(&self) -> Option<(i32, i32)>;
    fn release(&mut self);
}

impl VideoBackend for videoio::VideoCapture {
    fn position(&self) -> Result<f64, SourceError> {
        self.get(videoio::CAP_PROP_POS_FRAMES)
            .map_err(SourceError::Read)
    }

    fn frame_count(&self) -> Result<f64, SourceError> {
        self.get(videoio::CAP_PROP_FRAME_COUNT)
            .map_err(SourceError::Read)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.set(videoio::CAP_PROP_POS_FRAMES, 0.0)
            .map_err(SourceError::Read)?;
        Ok(())
    }

    fn read(&mut self, frame: &mut Mat) -> Result<bool, SourceError> {
        VideoCaptureTrait::read(self, frame).map_err(SourceError::Read)
    }

    fn frame_size(&self) -> Option<(i32, i32)> {
        let width = self.get(videoio::CAP_PROP_FRAME_WIDTH).ok()?;
        let height = self.get(videoio::CAP_PROP_FRAME_HEIGHT).ok()?;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some((width as i32, height as i32))
    }

    fn release(&mut self) {
        if let Err(e) = VideoCaptureTrait::release(self) {
            tracing::warn!("Failed to release video capture: {:?}", e);
        }
    }
}

/// Opens a fresh backend. Called once at startup to probe the source and
/// again whenever the feed goes from idle to streaming.
pub trait SourceOpener: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn VideoBackend>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct VideoFileOpener {
    path: String,
}

impl VideoFileOpener {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceOpener for VideoFileOpener {
    fn open(&self) -> Result<Box<dyn VideoBackend>, SourceError> {
        let capture = videoio::VideoCapture::from_file(&self.path, videoio::CAP_ANY)
            .map_err(SourceError::OpenFailed)?;
        if !capture.is_opened().map_err(SourceError::OpenFailed)? {
            return Err(SourceError::Unavailable(self.path.clone()));
        }
        tracing::info!("Opened video source {}", self.path);
        Ok(Box::new(capture))
    }
}

/// Looping reader over a backend: once the last frame has been read the next
/// call starts over from frame 0.
pub struct FrameSource {
    backend: Option<Box<dyn VideoBackend>>,
}

impl FrameSource {
    pub fn new(backend: Box<dyn VideoBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn open(opener: &dyn SourceOpener) -> Result<Self, SourceError> {
        Ok(Self::new(opener.open()?))
    }

    pub fn next_frame(&mut self) -> Result<Mat, SourceError> {
        let backend = self.backend.as_mut().ok_or(SourceError::Released)?;

        let total = backend.frame_count()?;
        if total > 0.0 && backend.position()? >= total {
            backend.rewind()?;
        }

        let mut frame = Mat::default();
        if !backend.read(&mut frame)? || frame.empty() {
            return Err(SourceError::EndOfStream);
        }
        Ok(frame)
    }

    pub fn frame_size(&self) -> Option<(i32, i32)> {
        self.backend.as_ref().and_then(|b| b.frame_size())
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use opencv::core::Vec3b;
    use std::sync::atomic::Ordering;

    fn level_of(frame: &Mat) -> u8 {
        frame.at_2d::<Vec3b>(0, 0).unwrap()[0]
    }

    #[test]
    fn test_next_frame_loops_back_to_first_frame() {
        let backend = SyntheticBackend::new(4, 4, vec![10, 20, 30]);
        let mut source = FrameSource::new(Box::new(backend));

        let levels: Vec<u8> = (0..7)
            .map(|_| level_of(&source.next_frame().unwrap()))
            .collect();

        assert_eq!(levels, vec![10, 20, 30, 10, 20, 30, 10]);
    }

    #[test]
    fn test_single_frame_source_repeats() {
        let backend = SyntheticBackend::new(4, 4, vec![0]);
        let mut source = FrameSource::new(Box::new(backend));

        for _ in 0..3 {
            let frame = source.next_frame().unwrap();
            assert_eq!(frame.rows(), 4);
            assert_eq!(frame.cols(), 4);
        }
    }

    #[test]
    fn test_empty_source_is_end_of_stream() {
        let backend = SyntheticBackend::new(4, 4, vec![]);
        let mut source = FrameSource::new(Box::new(backend));

        assert!(matches!(
            source.next_frame(),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_release_closes_backend_once() {
        let backend = SyntheticBackend::new(4, 4, vec![0]);
        let released = backend.released_flag();
        let mut source = FrameSource::new(Box::new(backend));

        assert!(source.is_open());
        source.release();
        assert!(released.load(Ordering::SeqCst));
        assert!(!source.is_open());
        assert!(matches!(source.next_frame(), Err(SourceError::Released)));

        source.release();
    }

    #[test]
    fn test_corrupt_frame_is_emitted_once() {
        let backend = SyntheticBackend::new(4, 4, vec![10, 20]).with_corrupt_frame(0);
        let mut source = FrameSource::new(Box::new(backend));

        let channels: Vec<i32> = (0..4)
            .map(|_| source.next_frame().unwrap().channels())
            .collect();

        assert_eq!(channels, vec![2, 3, 3, 3]);
    }

    #[test]
    fn test_open_errors_are_worded_apart() {
        let not_open = SourceError::Unavailable("parking.mp4".into()).to_string();
        let opencv = SourceError::OpenFailed(opencv::Error::new(0, "no backend")).to_string();

        assert_eq!(not_open, "Video source parking.mp4 is not open");
        assert!(opencv.starts_with("OpenCV error while opening video source"));
    }

    #[test]
    fn test_drop_releases_backend() {
        let backend = SyntheticBackend::new(4, 4, vec![0]);
        let released = backend.released_flag();
        drop(FrameSource::new(Box::new(backend)));

        assert!(released.load(Ordering::SeqCst));
    }
}
