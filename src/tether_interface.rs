use std::time::Instant;

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use log::{debug, error};
use serde::Serialize;
use tether_agent::{ChannelDefinition, ChannelOptionsBuilder, TetherAgent};

use crate::{
    backend_config::BackendConfig,
    messages::{CalibrationStatus, DepthFrameMessage, PresenceGridMessage},
    sensors::{DepthFrame, FrameMailbox},
    systems::{Systems, TickOutput},
};

pub struct Outputs {
    pub config_output: ChannelDefinition,
    pub listeners_output: ChannelDefinition,
    pub blobs_output: ChannelDefinition,
    pub presence_grid_output: ChannelDefinition,
    pub calibration_output: ChannelDefinition,
}

impl Outputs {
    pub fn new(tether_agent: &mut TetherAgent) -> Outputs {
        let config_output = ChannelOptionsBuilder::create_sender("provideDepthPresenceConfig")
            .qos(Some(2))
            .retain(Some(true))
            .build(tether_agent)
            .expect("failed to create Output Plug");

        // The one output that downstream show control actually needs
        let listeners_output = ChannelOptionsBuilder::create_sender("listeners")
            .qos(Some(0))
            .build(tether_agent)
            .expect("failed to create Output Plug");

        // Visualisation outputs
        let blobs_output = ChannelOptionsBuilder::create_sender("blobs")
            .qos(Some(0))
            .build(tether_agent)
            .expect("failed to create Output Plug");
        let presence_grid_output = ChannelOptionsBuilder::create_sender("presenceGrid")
            .qos(Some(0))
            .build(tether_agent)
            .expect("failed to create Output Plug");

        let calibration_output = ChannelOptionsBuilder::create_sender("calibration")
            .qos(Some(1))
            .build(tether_agent)
            .expect("failed to create Output Plug");

        Outputs {
            config_output,
            listeners_output,
            blobs_output,
            presence_grid_output,
            calibration_output,
        }
    }
}

pub struct Inputs {
    pub depth_frames_input: ChannelDefinition,
    pub save_config_input: ChannelDefinition,
    pub request_calibration_input: ChannelDefinition,
}

impl Inputs {
    pub fn new(tether_agent: &mut TetherAgent) -> Inputs {
        let depth_frames_input = ChannelOptionsBuilder::create_receiver("depthFrames")
            .qos(Some(0))
            .build(tether_agent)
            .expect("failed to create Input Plug");
        let save_config_input = ChannelOptionsBuilder::create_receiver("saveDepthPresenceConfig")
            .qos(Some(2))
            .build(tether_agent)
            .expect("failed to create Input Plug");
        let request_calibration_input = ChannelOptionsBuilder::create_receiver("requestCalibration")
            .qos(Some(2))
            .build(tether_agent)
            .expect("failed to create Input Plug");

        Inputs {
            depth_frames_input,
            save_config_input,
            request_calibration_input,
        }
    }
}

fn send_named<T: Serialize>(
    tether_agent: &TetherAgent,
    channel: &ChannelDefinition,
    data: &T,
) -> Result<()> {
    let payload = rmp_serde::to_vec_named(data)?;
    tether_agent
        .send(channel, Some(&payload))
        .map_err(|e| anyhow!("failed to publish: {}", e))
}

/// Decode a frame from sensor `serial` and leave it in that sensor's mailbox
/// for the next tick. Unknown sensors are added to the config, but only once
/// they have sent a valid frame. Returns true if a device was added.
pub fn accept_depth_frame(
    serial: &str,
    payload: &[u8],
    config: &mut BackendConfig,
    mailboxes: &mut IndexMap<String, FrameMailbox>,
    now: Instant,
) -> Result<bool> {
    let message: DepthFrameMessage = rmp_serde::from_slice(payload)
        .map_err(|e| anyhow!("failed to decode depth frame from {}: {}", serial, e))?;
    let frame = DepthFrame::from_message(message)?;

    let added = config.check_or_create_device(serial).is_some();
    mailboxes
        .entry(String::from(serial))
        .or_insert_with(|| FrameMailbox::new(config.sensor_timeout()))
        .post(frame, now);
    Ok(added)
}

/// As `accept_depth_frame`, re-publishing the config if a device was added
#[allow(clippy::too_many_arguments)]
pub fn handle_depth_frame_message(
    serial: &str,
    payload: &[u8],
    config: &mut BackendConfig,
    mailboxes: &mut IndexMap<String, FrameMailbox>,
    tether_agent: &TetherAgent,
    outputs: &Outputs,
    config_file_path: &str,
    now: Instant,
) -> Result<()> {
    if accept_depth_frame(serial, payload, config, mailboxes, now)? {
        if let Err(e) =
            config.save_and_republish(tether_agent, &outputs.config_output, config_file_path)
        {
            error!("Failed to save and republish config: {}", e);
        }
    }
    Ok(())
}

/// Send everything one tick produced
pub fn publish_tick(
    tether_agent: &TetherAgent,
    outputs: &Outputs,
    systems: &Systems,
    tick: &TickOutput,
    config: &BackendConfig,
    now: Instant,
) -> Result<()> {
    if let Some(listeners) = &tick.listeners {
        let payload = rmp_serde::to_vec(listeners)?;
        tether_agent
            .send(&outputs.listeners_output, Some(&payload))
            .map_err(|e| anyhow!("failed to publish listeners: {}", e))?;

        if !config.skip_some_outputs {
            send_named(tether_agent, &outputs.blobs_output, &systems.blob_reports())?;
            if let Some(grid) = systems.grid() {
                send_named(
                    tether_agent,
                    &outputs.presence_grid_output,
                    &PresenceGridMessage::from(grid),
                )?;
            }
        }
    }

    let calibration = &systems.calibration;
    if tick.calibration_transition.is_some()
        || (calibration.is_calibrating() && !config.skip_some_outputs)
    {
        let status = CalibrationStatus::new(calibration.state(), calibration.progress(now));
        debug!("Calibration status {:?}", status);
        send_named(tether_agent, &outputs.calibration_output, &status)?;
    }

    Ok(())
}
