use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use nalgebra::Point3;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::messages::DepthFrameMessage;

/// Focal lengths and principal point are given at this base resolution, and
/// scaled for frames of any other size.
pub const BASE_WIDTH: f32 = 640.0;
pub const BASE_HEIGHT: f32 = 480.0;

/// One depth image from one sensor, in millimetres; indexed `[[row, column]]`.
/// A value of zero means "no reading".
#[derive(Debug, Clone)]
pub struct DepthFrame {
    depths: Array2<u16>,
}

impl DepthFrame {
    pub fn new(depths: Array2<u16>) -> Self {
        DepthFrame { depths }
    }

    /// A frame where every pixel reads the same depth
    pub fn filled(width: usize, height: usize, depth: u16) -> Self {
        DepthFrame {
            depths: Array2::from_elem((height, width), depth),
        }
    }

    pub fn from_message(message: DepthFrameMessage) -> Result<Self> {
        let DepthFrameMessage {
            width,
            height,
            depths,
        } = message;
        let samples = depths.len();
        Array2::from_shape_vec((height, width), depths)
            .map(DepthFrame::new)
            .map_err(|e| {
                anyhow!(
                    "depth frame of {} samples does not fit {}x{}: {}",
                    samples,
                    width,
                    height,
                    e
                )
            })
    }

    pub fn width(&self) -> usize {
        self.depths.ncols()
    }

    pub fn height(&self) -> usize {
        self.depths.nrows()
    }

    pub fn pixel_count(&self) -> usize {
        self.depths.len()
    }

    pub fn depths(&self) -> &Array2<u16> {
        &self.depths
    }

    pub fn depths_mut(&mut self) -> &mut Array2<u16> {
        &mut self.depths
    }
}

/// Pinhole intrinsics of the depth camera, expressed at 640x480.
/// The defaults are those commonly used for the Kinect v1 depth camera.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepthIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Default for DepthIntrinsics {
    fn default() -> Self {
        DepthIntrinsics {
            fx: 594.21,
            fy: 591.04,
            cx: 339.5,
            cy: 242.7,
        }
    }
}

impl DepthIntrinsics {
    /// Intrinsics rescaled for a frame of the given size
    pub fn for_resolution(&self, width: usize, height: usize) -> DepthIntrinsics {
        let sx = width as f32 / BASE_WIDTH;
        let sy = height as f32 / BASE_HEIGHT;
        DepthIntrinsics {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
        }
    }

    /// Unproject pixel (column u, row v) at depth z into camera space (mm).
    /// With the sensor looking straight down, x/y lie on the floor plane.
    pub fn project(&self, u: usize, v: usize, z: f32) -> Point3<f32> {
        Point3::new(
            (u as f32 - self.cx) * z / self.fx,
            (v as f32 - self.cy) * z / self.fy,
            z,
        )
    }
}

/// Where a SensorTracker gets its frames from: "the current depth frame, if a
/// new one is available", never blocking.
pub trait DepthSource {
    fn take_new_frame(&mut self) -> Option<DepthFrame>;
    fn is_connected(&self, now: Instant) -> bool;
}

/// Holds only the most recent frame received for one sensor; older frames
/// that were never consumed by a tick are simply replaced.
pub struct FrameMailbox {
    latest: Option<DepthFrame>,
    last_received: Option<Instant>,
    timeout: Duration,
}

impl FrameMailbox {
    pub fn new(timeout: Duration) -> Self {
        FrameMailbox {
            latest: None,
            last_received: None,
            timeout,
        }
    }

    pub fn post(&mut self, frame: DepthFrame, now: Instant) {
        self.latest = Some(frame);
        self.last_received = Some(now);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl DepthSource for FrameMailbox {
    fn take_new_frame(&mut self) -> Option<DepthFrame> {
        self.latest.take()
    }

    fn is_connected(&self, now: Instant) -> bool {
        match self.last_received {
            Some(t) => now.saturating_duration_since(t) <= self.timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_message_shape() {
        let frame = DepthFrame::from_message(DepthFrameMessage {
            width: 3,
            height: 2,
            depths: vec![1, 2, 3, 4, 5, 6],
        })
        .unwrap();
        assert_eq!(frame.width(), 3);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.depths()[[1, 0]], 4);

        let bad = DepthFrame::from_message(DepthFrameMessage {
            width: 4,
            height: 2,
            depths: vec![1, 2, 3],
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_principal_point_projects_onto_axis() {
        let intrinsics = DepthIntrinsics {
            fx: 500.,
            fy: 500.,
            cx: 2.,
            cy: 3.,
        };
        let p = intrinsics.project(2, 3, 1500.);
        assert_eq!((p.x, p.y, p.z), (0., 0., 1500.));
        let q = intrinsics.project(7, 3, 1000.);
        assert!((q.x - 10.).abs() < 0.0001);
    }

    #[test]
    fn test_intrinsics_scale_with_resolution() {
        let half = DepthIntrinsics::default().for_resolution(320, 240);
        assert!((half.fx - 594.21 / 2.).abs() < 0.001);
        assert!((half.cy - 242.7 / 2.).abs() < 0.001);
    }

    #[test]
    fn test_mailbox_keeps_latest_frame_once() {
        let start = Instant::now();
        let mut mailbox = FrameMailbox::new(Duration::from_millis(100));
        assert!(!mailbox.is_connected(start));
        assert!(mailbox.take_new_frame().is_none());

        mailbox.post(DepthFrame::filled(2, 2, 1000), start);
        mailbox.post(DepthFrame::filled(2, 2, 2000), start);
        let frame = mailbox.take_new_frame().unwrap();
        assert_eq!(frame.depths()[[0, 0]], 2000);
        assert!(mailbox.take_new_frame().is_none());

        assert!(mailbox.is_connected(start + Duration::from_millis(100)));
        assert!(!mailbox.is_connected(start + Duration::from_millis(101)));
    }
}
