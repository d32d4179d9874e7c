pub mod background;
pub mod blobs;
pub mod calibration;
pub mod presence_grid;
pub mod sensor_tracker;

use std::time::Instant;

use blobs::Blob;
use calibration::{CalibrationController, CalibrationTransition};
use indexmap::IndexMap;
use log::{debug, info, warn};
use presence_grid::PresenceGrid;
use sensor_tracker::SensorTracker;

use crate::{
    Point2D, backend_config::BackendConfig, messages::BlobReport, sensors::DepthSource,
};

/// Result of one pass through the pipeline
#[derive(Debug, Default)]
pub struct TickOutput {
    pub calibration_transition: Option<CalibrationTransition>,
    /// Stage positions (mm) of every blob, only when the grid was rebuilt
    pub listeners: Option<Vec<Point2D>>,
}

pub struct Systems {
    pub trackers: IndexMap<String, SensorTracker>,
    pub calibration: CalibrationController,
    sensor_connected: IndexMap<String, bool>,
    grid: Option<PresenceGrid>,
    blobs: Vec<Blob>,
}

impl Systems {
    pub fn new(config: &BackendConfig) -> Systems {
        let mut calibration = CalibrationController::new(config.calibration_duration());
        if config.calibrate_on_start {
            info!("Will calibrate on start");
            calibration.request();
        }

        let mut systems = Systems {
            trackers: IndexMap::new(),
            calibration,
            sensor_connected: IndexMap::new(),
            grid: None,
            blobs: Vec::new(),
        };
        systems.sync_trackers(config);
        systems
    }

    /// One tracker per configured device; trackers for removed devices are dropped.
    /// A new tracker has no background yet, so it asks for a calibration
    /// unless one is already running.
    fn sync_trackers(&mut self, config: &BackendConfig) {
        self.trackers
            .retain(|serial, _| config.get_device(serial).is_some());
        let mut added = false;
        for device in config.devices() {
            let calibration = config.sensor_calibration(device);
            self.trackers
                .entry(device.serial.clone())
                .or_insert_with(|| {
                    info!("New sensor tracker for {}", &device.serial);
                    added = true;
                    SensorTracker::new(&device.serial, calibration)
                })
                .set_calibration(calibration);
        }
        if added && !self.calibration.is_calibrating() {
            self.calibration.request();
        }
    }

    /// Run the whole pipeline once: calibration state, every sensor, then
    /// (only if some sensor had a new frame) fusion and blob extraction
    pub fn tick<S: DepthSource>(
        &mut self,
        config: &BackendConfig,
        sources: &mut IndexMap<String, S>,
        now: Instant,
    ) -> TickOutput {
        self.sync_trackers(config);
        self.calibration.set_duration(config.calibration_duration());
        let calibration_transition = self.calibration.update(now);

        if calibration_transition == Some(CalibrationTransition::Started) {
            for tracker in self.trackers.values_mut() {
                tracker.clear_background();
            }
        }
        let calibrating = self.calibration.is_calibrating();

        let mut frame_pixels = 0;
        for (serial, tracker) in self.trackers.iter_mut() {
            tracker.set_calibrating(calibrating);
            let source = sources.get_mut(serial);

            let connected = source.as_ref().is_some_and(|s| s.is_connected(now));
            let was_connected = self.sensor_connected.insert(serial.clone(), connected);
            if was_connected == Some(true) && !connected {
                warn!("Sensor {} has stopped sending frames", serial);
            } else if was_connected != Some(true) && connected {
                info!("Sensor {} is connected", serial);
            }

            let frame = source.and_then(|s| s.take_new_frame());
            if let Some(f) = &frame {
                frame_pixels = frame_pixels.max(f.pixel_count());
            }
            tracker.update(frame);
        }

        if !self.trackers.values().any(|t| t.is_frame_new()) {
            return TickOutput {
                calibration_transition,
                listeners: None,
            };
        }

        let point_sets: Vec<_> = self
            .trackers
            .values_mut()
            .filter(|t| t.is_frame_new())
            .map(|t| t.take_points())
            .collect();

        let mapping = config.stage_mapping();
        let mut grid = PresenceGrid::build(
            &point_sets,
            mapping,
            config.presence_scale_factor(frame_pixels),
        );
        grid.blur(config.presence_blur);

        let blobs = config.blob_extractor().extract(&grid);
        let listeners: Vec<Point2D> = blobs
            .iter()
            .map(|b| mapping.grid_to_stage(b.centroid))
            .collect();
        debug!("Tick produced {} listeners", listeners.len());

        self.grid = Some(grid);
        self.blobs = blobs;

        TickOutput {
            calibration_transition,
            listeners: Some(listeners),
        }
    }

    /// The most recently built grid, if any
    pub fn grid(&self) -> Option<&PresenceGrid> {
        self.grid.as_ref()
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn blob_reports(&self) -> Vec<BlobReport> {
        match &self.grid {
            Some(grid) => self
                .blobs
                .iter()
                .map(|b| BlobReport::new(b, grid.mapping().grid_to_stage(b.centroid)))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        backend_config::DepthDevice,
        sensors::{DepthFrame, FrameMailbox},
    };

    const FLOOR: u16 = 2500;

    fn device(serial: &str) -> DepthDevice {
        DepthDevice {
            serial: String::from(serial),
            name: String::from(serial),
            rotation: 0.,
            x: 0.,
            y: 0.,
            background_threshold: 16,
        }
    }

    fn two_sensor_config() -> BackendConfig {
        BackendConfig {
            devices: vec![device("sw"), device("ne")],
            grid_divisions: 4,
            max_stretch: 500.,
            ..Default::default()
        }
    }

    fn mailboxes() -> IndexMap<String, FrameMailbox> {
        let mut sources = IndexMap::new();
        for serial in ["sw", "ne"] {
            sources.insert(
                String::from(serial),
                FrameMailbox::new(Duration::from_secs(1)),
            );
        }
        sources
    }

    fn frame_with_box(depth: u16) -> DepthFrame {
        let mut frame = DepthFrame::filled(8, 8, FLOOR);
        for row in 2..5 {
            for column in 2..5 {
                frame.depths_mut()[[row, column]] = depth;
            }
        }
        frame
    }

    fn post(
        sources: &mut IndexMap<String, FrameMailbox>,
        serial: &str,
        frame: DepthFrame,
        now: Instant,
    ) {
        sources.get_mut(serial).unwrap().post(frame, now);
    }

    /// Run a full calibration over an empty floor, as seen by both sensors
    fn calibrated(
        config: &BackendConfig,
        start: Instant,
    ) -> (Systems, IndexMap<String, FrameMailbox>) {
        let mut systems = Systems::new(config);
        let mut sources = mailboxes();
        post(&mut sources, "sw", DepthFrame::filled(8, 8, FLOOR), start);
        post(&mut sources, "ne", DepthFrame::filled(8, 8, FLOOR), start);
        let out = systems.tick(config, &mut sources, start);
        assert_eq!(out.calibration_transition, Some(CalibrationTransition::Started));
        assert_eq!(out.listeners, Some(vec![]));

        let end = start + config.calibration_duration();
        let out = systems.tick(config, &mut sources, end);
        assert_eq!(out.calibration_transition, Some(CalibrationTransition::Finished));
        assert_eq!(out.listeners, None);
        (systems, sources)
    }

    #[test]
    fn test_no_frames_no_rebuild() {
        let config = two_sensor_config();
        let start = Instant::now();
        let (mut systems, mut sources) = calibrated(&config, start);
        let grid_before = systems.grid().unwrap().densities().clone();

        let out = systems.tick(&config, &mut sources, start + Duration::from_secs(5));
        assert_eq!(out.calibration_transition, None);
        assert!(out.listeners.is_none());
        assert_eq!(systems.grid().unwrap().densities(), &grid_before);
    }

    #[test]
    fn test_nothing_before_any_frame() {
        let config = two_sensor_config();
        let mut systems = Systems::new(&config);
        let mut sources = mailboxes();
        let out = systems.tick(&config, &mut sources, Instant::now());
        assert!(out.listeners.is_none());
        assert!(systems.grid().is_none());
        assert!(systems.blob_reports().is_empty());
    }

    #[test]
    fn test_single_sensor_box_becomes_one_listener() {
        let config = two_sensor_config();
        let start = Instant::now();
        let (mut systems, mut sources) = calibrated(&config, start);

        let now = start + Duration::from_secs(3);
        post(&mut sources, "sw", frame_with_box(1500), now);
        let out = systems.tick(&config, &mut sources, now);

        let listeners = out.listeners.unwrap();
        assert_eq!(listeners.len(), 1);
        let expected = config.stage_mapping().cell_center_to_stage(1, 1);
        assert!((listeners[0].0 - expected.0).abs() < 0.001);
        assert!((listeners[0].1 - expected.1).abs() < 0.001);

        assert_eq!(systems.grid().unwrap().density_at(1, 1), 1.);
        let reports = systems.blob_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cells, 1);
        assert_eq!(reports[0].label, 0);
    }

    #[test]
    fn test_empty_floor_emits_empty_list() {
        let config = two_sensor_config();
        let start = Instant::now();
        let (mut systems, mut sources) = calibrated(&config, start);

        let now = start + Duration::from_secs(3);
        post(&mut sources, "ne", DepthFrame::filled(8, 8, FLOOR), now);
        let out = systems.tick(&config, &mut sources, now);
        assert_eq!(out.listeners, Some(vec![]));
    }

    #[test]
    fn test_recalibration_clears_and_suppresses() {
        let config = two_sensor_config();
        let start = Instant::now();
        let (mut systems, mut sources) = calibrated(&config, start);
        assert!(systems.trackers.values().all(|t| !t.background().is_clear()));

        systems.calibration.request();
        let t1 = start + Duration::from_secs(10);
        let out = systems.tick(&config, &mut sources, t1);
        assert_eq!(out.calibration_transition, Some(CalibrationTransition::Started));
        assert!(systems.trackers.values().all(|t| t.background().is_clear()));

        // Someone stands in view during the window: still nothing is reported
        let t2 = t1 + Duration::from_millis(500);
        post(&mut sources, "sw", frame_with_box(1500), t2);
        post(&mut sources, "ne", frame_with_box(1200), t2);
        let out = systems.tick(&config, &mut sources, t2);
        assert_eq!(out.listeners, Some(vec![]));
        assert!(systems.trackers.values().all(|t| t.points().is_empty()));
    }

    #[test]
    fn test_late_sensor_calibrates_before_reporting() {
        let mut config = two_sensor_config();
        let start = Instant::now();
        let (mut systems, mut sources) = calibrated(&config, start);

        // A third sensor shows up well after the startup window
        config.devices.push(device("late"));
        sources.insert(
            String::from("late"),
            FrameMailbox::new(Duration::from_secs(1)),
        );
        let t1 = start + Duration::from_secs(10);
        post(&mut sources, "late", DepthFrame::filled(8, 8, FLOOR), t1);
        let out = systems.tick(&config, &mut sources, t1);
        assert_eq!(out.calibration_transition, Some(CalibrationTransition::Started));
        assert_eq!(out.listeners, Some(vec![]));
        assert!(!systems.trackers["late"].background().is_clear());

        let t2 = t1 + config.calibration_duration();
        post(&mut sources, "late", DepthFrame::filled(8, 8, FLOOR), t2);
        let out = systems.tick(&config, &mut sources, t2);
        assert_eq!(out.calibration_transition, Some(CalibrationTransition::Finished));
        assert_eq!(out.listeners, Some(vec![]));
        assert!(systems.blob_reports().is_empty());
    }

    #[test]
    fn test_removed_device_drops_tracker() {
        let mut config = two_sensor_config();
        let mut systems = Systems::new(&config);
        assert_eq!(systems.trackers.len(), 2);

        config.devices.retain(|d| d.serial != "ne");
        let mut sources = mailboxes();
        systems.tick(&config, &mut sources, Instant::now());
        assert_eq!(systems.trackers.keys().collect::<Vec<_>>(), vec!["sw"]);
    }
}
