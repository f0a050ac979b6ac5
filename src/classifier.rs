use crate::config::{DetectorConfig, ThresholdMethod};
use crate::slots::Slot;
use opencv::{
    core::{self, Mat, Point, Size},
    imgproc,
    prelude::*,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Frame is empty")]
    EmptyFrame,
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// Single-channel binary raster derived from one frame. Non-zero pixels are
/// foreground.
pub struct ProcessedMask {
    mat: Mat,
}

impl ProcessedMask {
    pub fn from_mat(mat: Mat) -> Self {
        Self { mat }
    }

    pub fn mat(&self) -> &Mat {
        &self.mat
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    /// Counts foreground pixels inside the slot, clipped to the mask.
    pub fn count_in(&self, slot: &Slot) -> Result<i32, ClassifierError> {
        match slot.clipped_rect(self.width(), self.height()) {
            Some(rect) => {
                let crop = Mat::roi(&self.mat, rect)?;
                Ok(core::count_non_zero(&*crop)?)
            }
            None => Ok(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotVerdict {
    pub slot_id: usize,
    pub pixel_score: i32,
    pub occupied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancySummary {
    pub free_count: usize,
    pub total_count: usize,
}

impl OccupancySummary {
    pub fn from_verdicts(verdicts: &[SlotVerdict]) -> Self {
        Self {
            free_count: verdicts.iter().filter(|v| !v.occupied).count(),
            total_count: verdicts.len(),
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.total_count - self.free_count
    }

    pub fn label(&self) -> String {
        format!("Free: {}/{}", self.free_count, self.total_count)
    }
}

/// Stateless per-frame occupancy decision.
///
/// The mask pipeline is grayscale, Gaussian blur, inverted adaptive
/// threshold, median filter, then dilation. Empty asphalt is textured and
/// lights up the threshold step; a parked car's body is comparatively flat.
/// A slot is occupied once its foreground count reaches
/// `occupied_threshold`.
#[derive(Debug, Clone)]
pub struct OccupancyClassifier {
    params: DetectorConfig,
}

impl OccupancyClassifier {
    pub fn new(params: DetectorConfig) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DetectorConfig {
        &self.params
    }

    pub fn preprocess(&self, frame: &Mat) -> Result<ProcessedMask, ClassifierError> {
        if frame.empty() {
            return Err(ClassifierError::EmptyFrame);
        }
        let p = &self.params;

        let gray = if frame.channels() == 1 {
            frame.try_clone()?
        } else {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            gray
        };

        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(
            &gray,
            &mut blurred,
            Size::new(p.blur_kernel, p.blur_kernel),
            p.blur_sigma,
        )?;

        let adaptive_method = match p.threshold_method {
            ThresholdMethod::Gaussian => imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            ThresholdMethod::Mean => imgproc::ADAPTIVE_THRESH_MEAN_C,
        };
        let mut threshold = Mat::default();
        imgproc::adaptive_threshold(
            &blurred,
            &mut threshold,
            255.0,
            adaptive_method,
            imgproc::THRESH_BINARY_INV,
            p.block_size,
            p.bias,
        )?;

        let mut median = Mat::default();
        imgproc::median_blur(&threshold, &mut median, p.median_kernel)?;

        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(p.dilate_kernel, p.dilate_kernel),
            Point::new(-1, -1),
        )?;
        let mut dilated = Mat::default();
        imgproc::dilate(
            &median,
            &mut dilated,
            &kernel,
            Point::new(-1, -1),
            p.dilate_iterations,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        Ok(ProcessedMask::from_mat(dilated))
    }

    pub fn verdict(&self, slot_id: usize, pixel_score: i32) -> SlotVerdict {
        SlotVerdict {
            slot_id,
            pixel_score,
            occupied: pixel_score >= self.params.occupied_threshold,
        }
    }

    pub fn score(
        &self,
        mask: &ProcessedMask,
        slots: &[Slot],
    ) -> Result<Vec<SlotVerdict>, ClassifierError> {
        slots
            .iter()
            .map(|slot| Ok(self.verdict(slot.id, mask.count_in(slot)?)))
            .collect()
    }

    pub fn classify(
        &self,
        frame: &Mat,
        slots: &[Slot],
    ) -> Result<Vec<SlotVerdict>, ClassifierError> {
        let mask = self.preprocess(frame)?;
        self.score(&mask, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotRegistry;
    use opencv::core::{Scalar, Vec3b, CV_8UC1, CV_8UC3};

    fn blank(rows: i32, cols: i32, typ: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(value)).unwrap()
    }

    /// Mask with exactly `count` foreground pixels inside `slot`, filled row
    /// by row from its top-left corner.
    fn mask_with_count(slot: &Slot, count: i32) -> ProcessedMask {
        let mut mat = blank(200, 200, CV_8UC1, 0.0);
        for i in 0..count {
            let x = slot.x + i % slot.width;
            let y = slot.y + i / slot.width;
            *mat.at_2d_mut::<u8>(y, x).unwrap() = 255;
        }
        ProcessedMask::from_mat(mat)
    }

    fn textured_frame() -> Mat {
        let mut frame = blank(120, 160, CV_8UC3, 90.0);
        for y in 0..120 {
            for x in 0..160 {
                let v = ((x * 7 + y * 13) % 40 + if (x / 4 + y / 4) % 2 == 0 { 0 } else { 120 })
                    as u8;
                *frame.at_2d_mut::<Vec3b>(y, x).unwrap() = Vec3b::from([v, v, v]);
            }
        }
        frame
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());

        assert!(!classifier.verdict(0, 899).occupied);
        assert!(classifier.verdict(0, 900).occupied);
    }

    #[test]
    fn test_threshold_boundary_on_mask() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());
        let registry = SlotRegistry::from_origins(&[(10, 20)], 107, 48).unwrap();
        let slot = registry.slots()[0];

        let free = classifier.score(&mask_with_count(&slot, 899), registry.slots()).unwrap();
        assert_eq!(free[0].pixel_score, 899);
        assert!(!free[0].occupied);

        let occupied = classifier.score(&mask_with_count(&slot, 900), registry.slots()).unwrap();
        assert_eq!(occupied[0].pixel_score, 900);
        assert!(occupied[0].occupied);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let classifier = OccupancyClassifier::new(DetectorConfig {
            occupied_threshold: 10,
            ..DetectorConfig::default()
        });
        assert!(classifier.verdict(3, 10).occupied);
        assert_eq!(classifier.verdict(3, 10).slot_id, 3);
    }

    #[test]
    fn test_partial_slot_counts_only_in_bounds_pixels() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());
        let mask = ProcessedMask::from_mat(blank(20, 20, CV_8UC1, 255.0));
        let registry = SlotRegistry::from_origins(&[(15, 15), (40, 40)], 10, 10).unwrap();

        let verdicts = classifier.score(&mask, registry.slots()).unwrap();

        assert_eq!(verdicts[0].pixel_score, 25);
        assert_eq!(verdicts[1].pixel_score, 0);
    }

    #[test]
    fn test_black_frame_is_free() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());
        let registry = SlotRegistry::from_origins(&[(0, 0)], 10, 10).unwrap();
        let frame = blank(48, 64, CV_8UC3, 0.0);

        let verdicts = classifier.classify(&frame, registry.slots()).unwrap();
        let summary = OccupancySummary::from_verdicts(&verdicts);

        assert_eq!(verdicts[0].pixel_score, 0);
        assert!(!verdicts[0].occupied);
        assert_eq!(summary.free_count, 1);
        assert_eq!(summary.total_count, 1);
    }

    #[test]
    fn test_mask_matches_frame_size() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());
        let mask = classifier.preprocess(&textured_frame()).unwrap();

        assert_eq!(mask.width(), 160);
        assert_eq!(mask.height(), 120);
        assert_eq!(mask.mat().channels(), 1);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let classifier = OccupancyClassifier::new(DetectorConfig {
            occupied_threshold: 200,
            ..DetectorConfig::default()
        });
        let registry =
            SlotRegistry::from_origins(&[(0, 0), (40, 30), (100, 60), (150, 110)], 40, 30)
                .unwrap();
        let frame = textured_frame();

        let first = classifier.classify(&frame, registry.slots()).unwrap();
        let second = classifier.classify(&frame, registry.slots()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let classifier = OccupancyClassifier::new(DetectorConfig::default());
        assert!(matches!(
            classifier.preprocess(&Mat::default()),
            Err(ClassifierError::EmptyFrame)
        ));
    }

    #[test]
    fn test_summary_counts_add_up() {
        let verdicts = vec![
            SlotVerdict {
                slot_id: 0,
                pixel_score: 1200,
                occupied: true,
            },
            SlotVerdict {
                slot_id: 1,
                pixel_score: 40,
                occupied: false,
            },
            SlotVerdict {
                slot_id: 2,
                pixel_score: 899,
                occupied: false,
            },
        ];
        let summary = OccupancySummary::from_verdicts(&verdicts);

        assert_eq!(summary.free_count, 2);
        assert_eq!(summary.occupied_count(), 1);
        assert_eq!(summary.free_count + summary.occupied_count(), summary.total_count);
        assert_eq!(summary.label(), "Free: 2/3");
    }
}
