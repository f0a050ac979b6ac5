use crate::classifier::{OccupancySummary, SlotVerdict};
use crate::slots::Slot;
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("No verdict for slot {0}")]
    MissingVerdict(usize),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// Label drawn on a filled box, padded by `offset` on every side.
struct TextBox {
    scale: f64,
    thickness: i32,
    offset: i32,
    text_color: Scalar,
    box_color: Scalar,
}

impl TextBox {
    /// `origin` is the bottom-left corner of the text itself.
    fn draw(&self, frame: &mut Mat, text: &str, origin: Point) -> Result<(), AnnotateError> {
        let mut baseline = 0;
        let size = imgproc::get_text_size(
            text,
            imgproc::FONT_HERSHEY_PLAIN,
            self.scale,
            self.thickness,
            &mut baseline,
        )?;

        let background = Rect::new(
            origin.x - self.offset,
            origin.y - size.height - self.offset,
            size.width + 2 * self.offset,
            size.height + baseline + 2 * self.offset,
        );
        imgproc::rectangle(
            frame,
            background,
            self.box_color,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            frame,
            text,
            origin,
            imgproc::FONT_HERSHEY_PLAIN,
            self.scale,
            self.text_color,
            self.thickness,
            imgproc::LINE_AA,
            false,
        )?;
        Ok(())
    }
}

/// Draws slot outlines, per-slot scores and the free-count banner onto the
/// raw frame. Colours are BGR.
pub struct Annotator {
    free_color: Scalar,
    occupied_color: Scalar,
    free_thickness: i32,
    occupied_thickness: i32,
    summary_origin: Point,
    summary_color: Scalar,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            free_color: Scalar::new(0.0, 255.0, 0.0, 0.0),
            occupied_color: Scalar::new(0.0, 0.0, 255.0, 0.0),
            free_thickness: 5,
            occupied_thickness: 2,
            summary_origin: Point::new(100, 50),
            summary_color: Scalar::new(0.0, 200.0, 0.0, 0.0),
        }
    }
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotates `frame` in place. `verdicts` is matched to `slots` by slot id.
    pub fn annotate(
        &self,
        frame: &mut Mat,
        slots: &[Slot],
        verdicts: &[SlotVerdict],
        summary: &OccupancySummary,
    ) -> Result<(), AnnotateError> {
        for slot in slots {
            let verdict = verdicts
                .iter()
                .find(|v| v.slot_id == slot.id)
                .ok_or(AnnotateError::MissingVerdict(slot.id))?;

            let (color, thickness) = if verdict.occupied {
                (self.occupied_color, self.occupied_thickness)
            } else {
                (self.free_color, self.free_thickness)
            };

            imgproc::rectangle(frame, slot.rect(), color, thickness, imgproc::LINE_8, 0)?;

            TextBox {
                scale: 1.0,
                thickness: 2,
                offset: 0,
                text_color: Scalar::new(255.0, 255.0, 255.0, 0.0),
                box_color: color,
            }
            .draw(
                frame,
                &verdict.pixel_score.to_string(),
                Point::new(slot.x, slot.y + slot.height - 3),
            )?;
        }

        TextBox {
            scale: 3.0,
            thickness: 5,
            offset: 20,
            text_color: Scalar::new(255.0, 255.0, 255.0, 0.0),
            box_color: self.summary_color,
        }
        .draw(frame, &summary.label(), self.summary_origin)?;

        Ok(())
    }
}
