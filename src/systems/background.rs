use log::debug;
use ndarray::{Array2, Zip};

use crate::sensors::DepthFrame;

/// "Unknown" depth; any real reading is farther than this
pub const UNKNOWN_DEPTH: u16 = 0;

/// Reference depth of the empty stage, per pixel.
///
/// While calibrating, each cell keeps the farthest depth ever seen there, so
/// someone walking through the sensor's view during the calibration window
/// does not end up baked into the background.
pub struct BackgroundModel {
    reference: Option<Array2<u16>>,
    is_clear: bool,
}

impl BackgroundModel {
    pub fn new() -> Self {
        BackgroundModel {
            reference: None,
            is_clear: true,
        }
    }

    /// Reset every cell to unknown. Does nothing if already clear.
    pub fn clear(&mut self) {
        if self.is_clear {
            return;
        }
        if let Some(reference) = self.reference.as_mut() {
            reference.fill(UNKNOWN_DEPTH);
        }
        self.is_clear = true;
        debug!("Background cleared");
    }

    pub fn is_clear(&self) -> bool {
        self.is_clear
    }

    /// When `suppressed` (calibrating), adopt the farther of the stored and
    /// incoming depth at each pixel. Otherwise the background is left as is.
    pub fn update(&mut self, frame: &DepthFrame, suppressed: bool) {
        if !suppressed {
            return;
        }
        let depths = frame.depths();
        let same_shape = self
            .reference
            .as_ref()
            .is_some_and(|r| r.dim() == depths.dim());
        if same_shape {
            if let Some(reference) = self.reference.as_mut() {
                Zip::from(reference)
                    .and(depths)
                    .for_each(|r, &d| *r = (*r).max(d));
            }
        } else {
            debug!(
                "Background (re)allocated at {}x{}",
                frame.width(),
                frame.height()
            );
            self.reference = Some(depths.clone());
        }
        self.is_clear = false;
    }

    /// Reference depth at (row, column); unknown if nothing was learned yet
    pub fn depth_at(&self, row: usize, column: usize) -> u16 {
        self.reference
            .as_ref()
            .and_then(|r| r.get((row, column)).copied())
            .unwrap_or(UNKNOWN_DEPTH)
    }

    pub fn reference(&self) -> Option<&Array2<u16>> {
        self.reference.as_ref()
    }
}

impl Default for BackgroundModel {
    fn default() -> Self {
        BackgroundModel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_suppressed_leaves_background_unchanged() {
        let mut model = BackgroundModel::new();
        model.update(&DepthFrame::filled(4, 3, 2000), true);
        model.update(&DepthFrame::filled(4, 3, 2500), false);
        assert_eq!(model.depth_at(1, 1), 2000);
    }

    #[test]
    fn test_calibration_converges_to_farthest() {
        let mut model = BackgroundModel::new();
        for i in 0..10 {
            let mut frame = DepthFrame::filled(4, 3, 2000);
            // Something passes back and forth in front of one pixel
            frame.depths_mut()[[2, 3]] = if i % 2 == 0 { 2400 } else { 900 };
            model.update(&frame, true);
            assert_eq!(model.depth_at(2, 3), 2400);
        }
        assert_eq!(model.depth_at(0, 0), 2000);
    }

    #[test]
    fn test_near_first_then_far_still_wins() {
        let mut model = BackgroundModel::new();
        let mut frame = DepthFrame::filled(2, 2, 800);
        model.update(&frame, true);
        assert_eq!(model.depth_at(0, 1), 800);
        frame.depths_mut()[[0, 1]] = 2200;
        model.update(&frame, true);
        frame.depths_mut()[[0, 1]] = 700;
        model.update(&frame, true);
        assert_eq!(model.depth_at(0, 1), 2200);
    }

    #[test]
    fn test_clear_resets_to_unknown() {
        let mut model = BackgroundModel::new();
        assert!(model.is_clear());
        model.update(&DepthFrame::filled(2, 2, 1800), true);
        assert!(!model.is_clear());
        model.clear();
        assert!(model.is_clear());
        assert_eq!(model.depth_at(1, 1), UNKNOWN_DEPTH);
        model.clear();
        assert_eq!(model.depth_at(1, 1), UNKNOWN_DEPTH);
    }
}
