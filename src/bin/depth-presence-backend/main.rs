use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use env_logger::Env;
use indexmap::IndexMap;
use log::{debug, error, info};
use tether_agent::TetherAgentOptionsBuilder;
use tether_agent::tether_compliant_topic::TetherOrCustomTopic;

use tether_depth_presence::backend_config::load_config_from_file;
use tether_depth_presence::sensors::FrameMailbox;
use tether_depth_presence::systems::Systems;
use tether_depth_presence::tether_interface::{
    Inputs, Outputs, handle_depth_frame_message, publish_tick,
};

mod cli;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    // Initialize the logger from the environment

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level))
        .filter_module("paho_mqtt", log::LevelFilter::Warn)
        .filter_module("tether_agent", log::LevelFilter::Warn)
        .init();

    debug!("Started; args: {:?}", cli);

    let mut tether_agent = TetherAgentOptionsBuilder::new(&cli.agent_role)
        .id(Some(&cli.agent_group))
        .host(Some(&cli.tether_host.to_string()))
        .build()
        .expect("failed to init and/or connect Tether Agent");

    let inputs = Inputs::new(&mut tether_agent);
    let outputs = Outputs::new(&mut tether_agent);

    let mut config = load_config_from_file(&cli.config_path).expect("failed to load config");
    info!(
        "Loaded {} devices OK into Config; publish with retain=true",
        config.devices().len()
    );
    // Always save + publish on first start/load...
    config
        .save_and_republish(&tether_agent, &outputs.config_output, &cli.config_path)
        .expect("failed to save and publish config");

    let mut systems = Systems::new(&config);
    let mut mailboxes: IndexMap<String, FrameMailbox> = IndexMap::new();
    let mut last_tick = Instant::now();

    loop {
        let mut work_done = false;

        // Drain everything waiting, so each mailbox holds the latest frame
        while let Some((topic, message)) = tether_agent.check_messages() {
            work_done = true;

            if inputs.depth_frames_input.matches(&topic) {
                let serial_number = match &topic {
                    TetherOrCustomTopic::Tether(t) => t.id(),
                    TetherOrCustomTopic::Custom(s) => {
                        error!(
                            "The topic \"{}\" is not expected for depth frame messages",
                            &s
                        );
                        continue;
                    }
                };
                if let Err(e) = handle_depth_frame_message(
                    serial_number,
                    &message,
                    &mut config,
                    &mut mailboxes,
                    &tether_agent,
                    &outputs,
                    &cli.config_path,
                    Instant::now(),
                ) {
                    error!("Dropped depth frame: {}", e);
                }
            }

            if inputs.save_config_input.matches(&topic) {
                match config.handle_save_message(
                    &tether_agent,
                    &outputs.config_output,
                    &message,
                    &cli.config_path,
                ) {
                    Ok(()) => {
                        for mailbox in mailboxes.values_mut() {
                            mailbox.set_timeout(config.sensor_timeout());
                        }
                    }
                    Err(e) => error!("Config failed to update and save: {}", e),
                }
            }

            if inputs.request_calibration_input.matches(&topic) {
                info!("requestCalibration message");
                systems.calibration.request();
            }
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= config.tick_interval() {
            work_done = true;
            last_tick = now;

            let tick = systems.tick(&config, &mut mailboxes, now);
            if let Err(e) = publish_tick(&tether_agent, &outputs, &systems, &tick, &config, now) {
                error!("Failed to publish tick outputs: {}", e);
            }
        }

        if !work_done {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
