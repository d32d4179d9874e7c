use log::debug;
use nalgebra::distance;
use ndarray::Array2;

use crate::{
    Point2D,
    geometry_utils::{register_point, triangle_area},
    sensors::{DepthFrame, DepthIntrinsics},
};

use super::background::BackgroundModel;

/// Operator-tunable registration and filtering for one sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorCalibration {
    /// Planar offset (mm) applied after rotation
    pub offset: Point2D,
    /// Degrees
    pub rotation: f32,
    pub z_min: u16,
    pub z_max: u16,
    /// Minimum depth difference (mm) from background to count as foreground
    pub background_threshold: u16,
    /// Longest allowed edge (mm) between a sample and its neighbours
    pub max_stretch: f32,
    pub intrinsics: DepthIntrinsics,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        SensorCalibration {
            offset: (0., 0.),
            rotation: 0.,
            z_min: 200,
            z_max: 2600,
            background_threshold: 16,
            max_stretch: 100.,
            intrinsics: DepthIntrinsics::default(),
        }
    }
}

impl SensorCalibration {
    pub fn in_clip_range(&self, depth: u16) -> bool {
        depth >= self.z_min && depth <= self.z_max
    }
}

/// A registered sample on the stage, weighted by the floor area it stands for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePoint {
    pub position: Point2D,
    pub area: f32,
}

/// Exactly at the threshold counts as background
pub fn is_foreground(depth: u16, background: u16, threshold: u16) -> bool {
    (depth as i32 - background as i32).unsigned_abs() > threshold as u32
}

pub struct SensorTracker {
    serial: String,
    calibration: SensorCalibration,
    calibrating: bool,
    background: BackgroundModel,
    frame_new: bool,
    foreground: Option<Array2<bool>>,
    points: Vec<StagePoint>,
}

impl SensorTracker {
    pub fn new(serial: &str, calibration: SensorCalibration) -> Self {
        SensorTracker {
            serial: String::from(serial),
            calibration,
            calibrating: false,
            background: BackgroundModel::new(),
            frame_new: false,
            foreground: None,
            points: Vec::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Takes effect on the next `update`
    pub fn set_calibration(&mut self, calibration: SensorCalibration) {
        self.calibration = calibration;
    }

    pub fn calibration(&self) -> &SensorCalibration {
        &self.calibration
    }

    pub fn set_calibrating(&mut self, calibrating: bool) {
        self.calibrating = calibrating;
    }

    pub fn clear_background(&mut self) {
        self.background.clear();
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    /// Foreground pixels of the most recent frame (before stretch filtering)
    pub fn foreground_mask(&self) -> Option<&Array2<bool>> {
        self.foreground.as_ref()
    }

    pub fn is_frame_new(&self) -> bool {
        self.frame_new
    }

    pub fn points(&self) -> &[StagePoint] {
        &self.points
    }

    /// Hand over this tick's points; the tracker keeps nothing of them
    pub fn take_points(&mut self) -> Vec<StagePoint> {
        std::mem::take(&mut self.points)
    }

    /// Consume the sensor's new frame, if there was one this tick
    pub fn update(&mut self, frame: Option<DepthFrame>) {
        self.points.clear();
        self.frame_new = frame.is_some();

        let Some(frame) = frame else {
            return;
        };

        self.background.update(&frame, self.calibrating);

        if self.calibrating {
            self.foreground = Some(Array2::from_elem(frame.depths().dim(), false));
            return;
        }

        let foreground = self.find_foreground(&frame);
        self.points = self.register_points(&frame, &foreground);
        self.foreground = Some(foreground);

        debug!(
            "Sensor {}: {} stage points from {}x{} frame",
            self.serial,
            self.points.len(),
            frame.width(),
            frame.height()
        );
    }

    fn find_foreground(&self, frame: &DepthFrame) -> Array2<bool> {
        let c = &self.calibration;
        Array2::from_shape_fn(frame.depths().dim(), |(row, column)| {
            let depth = frame.depths()[[row, column]];
            c.in_clip_range(depth)
                && is_foreground(
                    depth,
                    self.background.depth_at(row, column),
                    c.background_threshold,
                )
        })
    }

    /// Project each foreground pixel, together with its right and lower
    /// neighbours, and keep it only if that small triangle is not stretched
    /// across a depth discontinuity. The triangle's area is the weight.
    fn register_points(&self, frame: &DepthFrame, foreground: &Array2<bool>) -> Vec<StagePoint> {
        let c = &self.calibration;
        let depths = frame.depths();
        let (height, width) = depths.dim();
        let intrinsics = c.intrinsics.for_resolution(width, height);

        let mut points = Vec::new();
        for ((row, column), &is_fg) in foreground.indexed_iter() {
            if !is_fg || row + 1 >= height || column + 1 >= width {
                continue;
            }
            let right = depths[[row, column + 1]];
            let below = depths[[row + 1, column]];
            if !c.in_clip_range(right) || !c.in_clip_range(below) {
                continue;
            }

            let a = intrinsics.project(column, row, depths[[row, column]] as f32);
            let b = intrinsics.project(column + 1, row, right as f32);
            let d = intrinsics.project(column, row + 1, below as f32);

            if distance(&a, &b) > c.max_stretch || distance(&a, &d) > c.max_stretch {
                continue;
            }

            points.push(StagePoint {
                position: register_point((a.x, a.y), c.rotation, c.offset),
                area: triangle_area(&a, &b, &d),
            });
        }
        points
    }
}
