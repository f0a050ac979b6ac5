use crate::{service::OccupancyService, source::SourceError};
use bytes::Bytes;
use futures::stream;
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

pub const FRAME_BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(#[from] opencv::Error),
    #[error("JPEG encoder rejected the frame")]
    Rejected,
}

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Live feed is unavailable.")]
    Unavailable,
    #[error("Video source error: {0}")]
    Source(#[from] SourceError),
    #[error("Pipeline worker failed: {0}")]
    Worker(String),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

pub fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>, EncodeError> {
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    let mut buf = Vector::<u8>::new();
    if !imgcodecs::imencode(".jpg", frame, &mut buf, &params)? {
        return Err(EncodeError::Rejected);
    }
    Ok(buf.into())
}

/// Wraps one JPEG as a part of a `multipart/x-mixed-replace` body.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        jpeg.len()
    );
    let mut body = part_header.into_bytes();
    body.extend_from_slice(jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

/// One consumer's view of the live feed: an endless, pull-based sequence of
/// multipart parts. It cannot be restarted once it has ended or been closed.
///
/// Dropping the stream detaches the consumer, so a client disconnect tears
/// it down without any extra bookkeeping from the transport.
pub struct FrameStream {
    service: Arc<OccupancyService>,
    frame_delay: Duration,
    attached: bool,
}

impl FrameStream {
    pub(crate) fn new(service: Arc<OccupancyService>, frame_delay: Duration) -> Self {
        Self {
            service,
            frame_delay,
            attached: true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Produces the next part. Skipped frames are not surfaced; a read
    /// failure is yielded once and ends the stream.
    pub async fn next_part(&mut self) -> Option<Result<Bytes, VideoStreamError>> {
        while self.attached {
            if !self.frame_delay.is_zero() {
                sleep(self.frame_delay).await;
            }

            let service = self.service.clone();
            match tokio::task::spawn_blocking(move || service.next_frame()).await {
                Ok(Ok(Some(frame))) => {
                    self.service.frame_streamed();
                    return Some(Ok(multipart_part(&frame.jpeg)));
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::error!("Error getting frame, closing stream: {:?}", e);
                    self.close();
                    return Some(Err(VideoStreamError::Source(e)));
                }
                Err(e) => {
                    tracing::error!("Pipeline worker failed, closing stream: {:?}", e);
                    self.close();
                    return Some(Err(VideoStreamError::Worker(e.to_string())));
                }
            }
        }
        None
    }

    /// Detaches from the service. Safe to call more than once.
    pub fn close(&mut self) {
        if self.attached {
            self.attached = false;
            self.service.detach();
        }
    }

    #[instrument(skip(self))]
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        stream::unfold(self, |mut feed| async move {
            let item = feed.next_part().await?;
            Some((item, feed))
        })
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.close();
    }
}
