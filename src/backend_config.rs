use std::{fs, io::ErrorKind, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tether_agent::{ChannelDefinition, TetherAgent};

use crate::{
    sensors::DepthIntrinsics,
    systems::{blobs::BlobExtractor, presence_grid::StageMapping, sensor_tracker::SensorCalibration},
};

/// 15 feet 8 inches, in mm
pub const DEFAULT_STAGE_SIZE: f32 = 4775.2;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepthDevice {
    pub serial: String,
    pub name: String,
    /// Degrees
    pub rotation: f32,
    pub x: f32,
    pub y: f32,
    pub background_threshold: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub devices: Vec<DepthDevice>,

    /// Side of the (square) stage, in mm, centred on the origin
    pub stage_size: f32,

    // -------- CALIBRATION SETTINGS
    /// How long (ms) to rebuild backgrounds for, once calibration is requested
    pub calibration_time_ms: u64,

    /// Request a calibration as soon as the agent starts
    pub calibrate_on_start: bool,

    /// Default background threshold (mm) for newly discovered sensors
    pub default_background_threshold: u16,

    // -------- SENSOR SETTINGS
    /// Depth samples nearer than this (mm) are ignored
    pub z_clip_min: u16,

    /// Depth samples farther than this (mm) are ignored
    pub z_clip_max: u16,

    /// Longest allowed distance (mm) between neighbouring samples; longer
    /// edges are depth discontinuities, not surfaces
    pub max_stretch: f32,

    /// Intrinsics shared by all sensors, at 640x480
    pub intrinsics: DepthIntrinsics,

    /// How long (ms) without frames before a sensor counts as disconnected
    pub sensor_timeout_ms: u64,

    // -------- PRESENCE GRID SETTINGS
    pub grid_divisions: usize,

    /// Box blur radius in cells; 0 disables
    pub presence_blur: usize,

    /// Larger values need more sample area to fill a cell
    pub presence_scale: f32,

    // -------- BLOB SETTINGS
    /// Equivalent radius, in cells
    pub blob_min_radius: f32,

    /// Equivalent radius, in cells
    pub blob_max_radius: f32,

    /// Minimum density (0-1) for a cell to be occupied
    pub blob_threshold: f32,

    /// How often (ms) to run the pipeline
    pub tick_interval_ms: u64,

    /// If enabled, skip publishing messages that are only used for visualisation
    pub skip_some_outputs: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            devices: Vec::new(),
            stage_size: DEFAULT_STAGE_SIZE,
            calibration_time_ms: 2000,
            calibrate_on_start: true,
            default_background_threshold: 16,
            z_clip_min: 200,
            z_clip_max: 2600,
            max_stretch: 100.,
            intrinsics: DepthIntrinsics::default(),
            sensor_timeout_ms: 1000,
            grid_divisions: 64,
            presence_blur: 0,
            presence_scale: 100.,
            blob_min_radius: 0.,
            blob_max_radius: 40.,
            blob_threshold: 0.02,
            tick_interval_ms: 16,
            skip_some_outputs: false,
        }
    }
}

impl BackendConfig {
    pub fn parse_remote_config(&mut self, payload: &[u8]) -> Result<()> {
        match rmp_serde::from_slice::<BackendConfig>(payload) {
            Ok(config) => {
                *self = config;
                Ok(())
            }
            Err(e) => Err(anyhow!("Failed to parse Config from message: {}", e)),
        }
    }

    pub fn write_config_to_file(&self, config_file_path: &str) -> Result<()> {
        debug!("Current state of config: {:?}", self);
        let text = serde_json::to_string_pretty(self)?;
        fs::write(config_file_path, text)
            .with_context(|| format!("Error writing config to file {}", config_file_path))?;
        info!("Wrote config to file: {:?}", config_file_path);
        Ok(())
    }

    /**  If the device is known, return None; if unknown, create it and return
    Some(())
    */
    pub fn check_or_create_device(&mut self, serial: &str) -> Option<()> {
        let existing = self.devices.iter().find(|&d| d.serial.eq(serial));
        match existing {
            Some(_device) => None,
            None => {
                warn!("Unrecognised depth sensor with serial {}", serial);
                self.devices.push(DepthDevice {
                    serial: String::from(serial),
                    name: String::from(serial),
                    rotation: 0.,
                    x: 0.,
                    y: 0.,
                    background_threshold: self.default_background_threshold,
                });
                info!("Creating a device with defaults for serial {}", serial);
                Some(())
            }
        }
    }

    pub fn get_device(&self, serial: &str) -> Option<&DepthDevice> {
        self.devices.iter().find(|&d| d.serial.eq(serial))
    }

    pub fn devices(&self) -> &Vec<DepthDevice> {
        &self.devices
    }

    /// Registration and filtering for one sensor: its own placement and
    /// threshold, plus the clip range and stretch limit shared by all sensors
    pub fn sensor_calibration(&self, device: &DepthDevice) -> SensorCalibration {
        SensorCalibration {
            offset: (device.x, device.y),
            rotation: device.rotation,
            z_min: self.z_clip_min,
            z_max: self.z_clip_max,
            background_threshold: device.background_threshold,
            max_stretch: self.max_stretch,
            intrinsics: self.intrinsics,
        }
    }

    pub fn stage_mapping(&self) -> StageMapping {
        StageMapping::new(self.grid_divisions, self.stage_size)
    }

    /// Scale applied to sample areas so that a grid of any resolution, fed
    /// by frames of any size, lands in a comparable density range
    pub fn presence_scale_factor(&self, frame_pixels: usize) -> f32 {
        let grid_area = (self.grid_divisions * self.grid_divisions) as f32;
        let denominator = frame_pixels as f32 * self.presence_scale;
        if denominator > 0. {
            grid_area / denominator
        } else {
            0.
        }
    }

    pub fn blob_extractor(&self) -> BlobExtractor {
        BlobExtractor::new(
            self.blob_min_radius,
            self.blob_max_radius,
            self.blob_threshold,
        )
    }

    pub fn calibration_duration(&self) -> Duration {
        Duration::from_millis(self.calibration_time_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    pub fn handle_save_message(
        &mut self,
        tether_agent: &TetherAgent,
        config_output: &ChannelDefinition,
        payload: &[u8],
        config_file_path: &str,
    ) -> Result<()> {
        self.parse_remote_config(payload)
            .context("Handle save-message failure")?;
        info!("Remote-provided config parsed OK; now save to disk and (re) publish");
        self.save_and_republish(tether_agent, config_output, config_file_path)
    }

    pub fn save_and_republish(
        &self,
        tether_agent: &TetherAgent,
        config_output: &ChannelDefinition,
        config_file_path: &str,
    ) -> Result<()> {
        info!("Saving config to disk and re-publishing via Tether...");
        self.write_config_to_file(config_file_path)?;

        let payload = rmp_serde::to_vec_named(self)?;
        tether_agent
            .send(config_output, Some(&payload))
            .map_err(|e| anyhow!("failed to publish config: {}", e))?;
        Ok(())
    }
}

pub fn load_config_from_file(config_file_path: &str) -> Result<BackendConfig> {
    match fs::read_to_string(config_file_path) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(
                "Config file not found, will create a default one at {}",
                config_file_path
            );
            let config = BackendConfig::default();
            debug!("Created init config object {:?}", config);
            Ok(config)
        }
        Err(e) => Err(anyhow!(
            "Failed to load config from {}: {}",
            config_file_path,
            e
        )),
        Ok(s) => {
            info!("Loaded config OK from \"{}\"", config_file_path);
            let loaded_config = serde_json::from_str::<BackendConfig>(&s)
                .map_err(|e| anyhow!("Failed to parse config data: {}", e))?;
            debug!("Config parsed data from file: {:?}", &loaded_config);
            Ok(loaded_config)
        }
    }
}
