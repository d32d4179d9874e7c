pub mod backend_config;
pub mod geometry_utils;
pub mod messages;
pub mod sensors;
pub mod systems;
pub mod tether_interface;

pub type Point2D = (f32, f32);
