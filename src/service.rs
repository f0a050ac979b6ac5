use crate::{
    annotator::{AnnotateError, Annotator},
    classifier::{ClassifierError, OccupancyClassifier, OccupancySummary, SlotVerdict},
    config::Config,
    slots::{ConfigError, SlotRegistry},
    source::{FrameSource, SourceError, SourceOpener},
    stream::{encode_jpeg, EncodeError, FrameStream},
    telemetry::Metrics,
};
use opencv::core::Mat;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Video source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
}

/// Failures local to one frame. The frame is dropped and the stream goes on.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Classification failed: {0}")]
    Classify(#[from] ClassifierError),
    #[error("Annotation failed: {0}")]
    Annotate(#[from] AnnotateError),
    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl FrameError {
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::Classify(_) => "classify",
            FrameError::Annotate(_) => "annotate",
            FrameError::Encode(_) => "encode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Unavailable,
    Idle,
    Streaming,
}

pub struct AnnotatedFrame {
    pub jpeg: Vec<u8>,
    pub verdicts: Vec<SlotVerdict>,
    pub summary: OccupancySummary,
}

struct SharedSource {
    source: Option<FrameSource>,
    consumers: usize,
}

/// Owns everything the live feed needs. Built once at startup; request
/// handlers share it through `Arc`.
///
/// All consumers read from one frame source. Reads are serialised by the
/// lock, so concurrent viewers each see an interleaved subset of the frames.
/// The source handle is open only while at least one consumer is attached.
pub struct OccupancyService {
    registry: SlotRegistry,
    classifier: OccupancyClassifier,
    annotator: Annotator,
    opener: Arc<dyn SourceOpener>,
    shared: Mutex<SharedSource>,
    jpeg_quality: i32,
    frame_delay: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl OccupancyService {
    /// Validates the detector parameters, loads the slot layout, then probes
    /// the video source once to check the slots against its frame size. The
    /// source is never opened when the layout fails to load.
    pub fn attempt_init(
        config: &Config,
        opener: Arc<dyn SourceOpener>,
    ) -> Result<Self, StartupError> {
        config
            .detector
            .validate()
            .map_err(ConfigError::InvalidDetector)?;

        let registry = SlotRegistry::from_config(&config.slots)?;

        let mut probe = FrameSource::open(opener.as_ref())?;
        match probe.frame_size() {
            Some((width, height)) => registry.ensure_within(width, height)?,
            None => {
                tracing::warn!("Video source does not report its frame size, slot bounds unchecked")
            }
        }
        probe.release();

        Ok(Self {
            registry,
            classifier: OccupancyClassifier::new(config.detector.clone()),
            annotator: Annotator::new(),
            opener,
            shared: Mutex::new(SharedSource {
                source: None,
                consumers: 0,
            }),
            jpeg_quality: config.video.jpeg_quality,
            frame_delay: Duration::from_millis(config.video.get_stream_delay_ms()),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.lock().consumers
    }

    pub fn state(&self) -> FeedState {
        if self.consumer_count() > 0 {
            FeedState::Streaming
        } else {
            FeedState::Idle
        }
    }

    /// Attaches a new consumer, opening the source on the idle to streaming
    /// transition.
    pub fn subscribe(self: &Arc<Self>) -> Result<FrameStream, SourceError> {
        let consumers = {
            let mut shared = self.shared.lock();
            if shared.source.is_none() {
                shared.source = Some(FrameSource::open(self.opener.as_ref())?);
                tracing::info!("Live feed streaming, video source opened");
            }
            shared.consumers += 1;
            shared.consumers
        };
        tracing::debug!("Consumer attached, {} active", consumers);
        self.record(|m| m.record_active_consumers(consumers));

        Ok(FrameStream::new(self.clone(), self.frame_delay))
    }

    /// Detaches one consumer. The last one out releases the source.
    pub(crate) fn detach(&self) {
        let consumers = {
            let mut shared = self.shared.lock();
            shared.consumers = shared.consumers.saturating_sub(1);
            if shared.consumers == 0 {
                if let Some(mut source) = shared.source.take() {
                    source.release();
                    tracing::info!("Live feed idle, video source released");
                }
            }
            shared.consumers
        };
        tracing::debug!("Consumer detached, {} active", consumers);
        self.record(|m| m.record_active_consumers(consumers));
    }

    /// Reads the next frame and runs it through the pipeline. `Ok(None)`
    /// means the frame was skipped; a read error ends the caller's stream.
    pub fn next_frame(&self) -> Result<Option<AnnotatedFrame>, SourceError> {
        let started = Instant::now();

        let frame = {
            let mut shared = self.shared.lock();
            shared
                .source
                .as_mut()
                .ok_or(SourceError::Released)
                .and_then(|source| source.next_frame())
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.record(|m| m.record_read_failure());
                return Err(e);
            }
        };

        match self.process_frame(frame) {
            Ok(annotated) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.record(|m| {
                    m.record_pipeline_duration(elapsed);
                    m.record_free_slots(annotated.summary.free_count as u64);
                });
                Ok(Some(annotated))
            }
            Err(e) => {
                tracing::warn!("Skipping frame: {}", e);
                self.record(|m| m.record_frame_skipped(e.reason()));
                Ok(None)
            }
        }
    }

    /// Classify, annotate in place, encode.
    pub fn process_frame(&self, mut frame: Mat) -> Result<AnnotatedFrame, FrameError> {
        let slots = self.registry.slots();
        let verdicts = self.classifier.classify(&frame, slots)?;
        let summary = OccupancySummary::from_verdicts(&verdicts);

        self.annotator
            .annotate(&mut frame, slots, &verdicts, &summary)?;
        let jpeg = encode_jpeg(&frame, self.jpeg_quality)?;

        Ok(AnnotatedFrame {
            jpeg,
            verdicts,
            summary,
        })
    }

    /// Counts a part handed to a consumer.
    pub(crate) fn frame_streamed(&self) {
        self.record(|m| m.record_frame_streamed());
    }

    fn record(&self, f: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

/// What the HTTP layer sees: either a running service or the reason startup
/// failed. Decided once and never re-probed.
#[derive(Clone)]
pub enum LiveFeed {
    Available(Arc<OccupancyService>),
    Unavailable(Arc<str>),
}

impl LiveFeed {
    pub fn start(config: &Config, opener: Arc<dyn SourceOpener>, metrics: Arc<Metrics>) -> Self {
        match OccupancyService::attempt_init(config, opener) {
            Ok(service) => {
                tracing::info!(
                    "Live feed available with {} slots",
                    service.registry().count()
                );
                Self::Available(Arc::new(service.with_metrics(metrics)))
            }
            Err(e) => {
                tracing::warn!("Live feed disabled: {}", e);
                Self::Unavailable(e.to_string().into())
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, LiveFeed::Available(_))
    }

    pub fn state(&self) -> FeedState {
        match self {
            LiveFeed::Available(service) => service.state(),
            LiveFeed::Unavailable(_) => FeedState::Unavailable,
        }
    }

    pub fn service(&self) -> Option<&Arc<OccupancyService>> {
        match self {
            LiveFeed::Available(service) => Some(service),
            LiveFeed::Unavailable(_) => None,
        }
    }
}
