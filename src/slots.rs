use crate::config::SlotsConfig;
use opencv::core::Rect;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Slot layout file not found: {0:?}")]
    LayoutMissing(PathBuf),
    #[error("Slot layout file {path:?} is malformed: {source}")]
    LayoutMalformed {
        path: PathBuf,
        source: config::ConfigError,
    },
    #[error("Slot layout file {0:?} holds no slot")]
    LayoutEmpty(PathBuf),
    #[error("Slot size must be positive, got {width}x{height}")]
    InvalidSlotSize { width: i32, height: i32 },
    #[error("Slot {id} has a negative origin ({x}, {y})")]
    NegativeOrigin { id: usize, x: i32, y: i32 },
    #[error("Slot {id} at ({x}, {y}) does not fit a {frame_width}x{frame_height} frame")]
    SlotOutOfBounds {
        id: usize,
        x: i32,
        y: i32,
        frame_width: i32,
        frame_height: i32,
    },
    #[error("Invalid detector parameters: {0}")]
    InvalidDetector(String),
}

/// One parking space: a fixed rectangle of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: usize,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Slot {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// The part of the slot that lies inside a `frame_width`x`frame_height`
    /// raster, or `None` when they do not overlap.
    pub fn clipped_rect(&self, frame_width: i32, frame_height: i32) -> Option<Rect> {
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = self.x.saturating_add(self.width).min(frame_width);
        let y2 = self.y.saturating_add(self.height).min(frame_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

#[derive(Debug, Deserialize)]
struct SlotOrigin {
    x: i32,
    y: i32,
}

#[derive(Debug, Deserialize)]
struct SlotLayout {
    #[serde(default)]
    positions: Vec<SlotOrigin>,
}

/// The fixed slot set. Loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SlotRegistry {
    slots: Vec<Slot>,
    width: i32,
    height: i32,
}

impl SlotRegistry {
    pub fn from_config(slots_config: &SlotsConfig) -> Result<Self, ConfigError> {
        Self::load(
            &slots_config.layout_file,
            slots_config.width,
            slots_config.height,
        )
    }

    pub fn load(layout_file: &Path, width: i32, height: i32) -> Result<Self, ConfigError> {
        if !layout_file.is_file() {
            return Err(ConfigError::LayoutMissing(layout_file.to_path_buf()));
        }

        let malformed = |source| ConfigError::LayoutMalformed {
            path: layout_file.to_path_buf(),
            source,
        };

        let layout = config::Config::builder()
            .add_source(config::File::from(layout_file).format(config::FileFormat::Yaml))
            .build()
            .map_err(malformed)?
            .try_deserialize::<SlotLayout>()
            .map_err(malformed)?;

        if layout.positions.is_empty() {
            return Err(ConfigError::LayoutEmpty(layout_file.to_path_buf()));
        }

        let origins: Vec<(i32, i32)> = layout.positions.iter().map(|o| (o.x, o.y)).collect();
        let registry = Self::from_origins(&origins, width, height)?;

        tracing::info!(
            "Loaded {} slots of {}x{} from {:?}",
            registry.count(),
            width,
            height,
            layout_file
        );

        Ok(registry)
    }

    pub fn from_origins(
        origins: &[(i32, i32)],
        width: i32,
        height: i32,
    ) -> Result<Self, ConfigError> {
        if width <= 0 || height <= 0 {
            return Err(ConfigError::InvalidSlotSize { width, height });
        }

        let slots = origins
            .iter()
            .enumerate()
            .map(|(id, &(x, y))| {
                if x < 0 || y < 0 {
                    return Err(ConfigError::NegativeOrigin { id, x, y });
                }
                Ok(Slot {
                    id,
                    x,
                    y,
                    width,
                    height,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            slots,
            width,
            height,
        })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot_size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    /// Checks every slot against the frame dimensions reported by the video
    /// source. The first offending slot is reported. A far edge that
    /// overflows `i32` counts as out of bounds.
    pub fn ensure_within(&self, frame_width: i32, frame_height: i32) -> Result<(), ConfigError> {
        match self
            .slots
            .iter()
            .find(|s| !fits(s.x, s.width, frame_width) || !fits(s.y, s.height, frame_height))
        {
            Some(slot) => Err(ConfigError::SlotOutOfBounds {
                id: slot.id,
                x: slot.x,
                y: slot.y,
                frame_width,
                frame_height,
            }),
            None => Ok(()),
        }
    }
}

fn fits(origin: i32, extent: i32, limit: i32) -> bool {
    origin.checked_add(extent).is_some_and(|end| end <= limit)
}
