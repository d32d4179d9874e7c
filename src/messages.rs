use serde::{Deserialize, Serialize};

use crate::{
    Point2D,
    systems::{blobs::Blob, calibration::CalibrationState, presence_grid::PresenceGrid},
};

/// As sent by a depth camera agent on "depthFrames"; row-major, millimetres
#[derive(Serialize, Deserialize, Debug)]
pub struct DepthFrameMessage {
    pub width: usize,
    pub height: usize,
    pub depths: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BlobReport {
    pub label: usize,
    /// Stage position (mm)
    pub x: f32,
    pub y: f32,
    /// Centroid in grid cells
    pub grid_x: f32,
    pub grid_y: f32,
    pub cells: usize,
    pub radius: f32,
}

impl BlobReport {
    pub fn new(blob: &Blob, stage_position: Point2D) -> Self {
        BlobReport {
            label: blob.label,
            x: stage_position.0,
            y: stage_position.1,
            grid_x: blob.centroid.0,
            grid_y: blob.centroid.1,
            cells: blob.size,
            radius: blob.radius(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PresenceGridMessage {
    pub divisions: usize,
    pub densities: Vec<f32>,
}

impl From<&PresenceGrid> for PresenceGridMessage {
    fn from(grid: &PresenceGrid) -> Self {
        PresenceGridMessage {
            divisions: grid.divisions(),
            densities: grid.densities().iter().cloned().collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CalibrationStatus {
    pub calibrating: bool,
    pub progress: f32,
}

impl CalibrationStatus {
    pub fn new(state: CalibrationState, progress: f32) -> Self {
        CalibrationStatus {
            calibrating: matches!(state, CalibrationState::Calibrating),
            progress,
        }
    }
}
