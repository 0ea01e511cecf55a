//! Road matching and display smoothing for a driving HUD.
//!
//! A [`session::DriveSession`] consumes GPS fixes, matches them against road
//! segments from a [`source::RoadSource`], debounces the road attributes shown
//! to the driver and animates the position marker between fixes.

pub mod config;
pub mod debug;
pub mod geometry;
pub mod matcher;
pub mod predictor;
pub mod render;
pub mod road;
pub mod sensor;
pub mod session;
pub mod smoother;
pub mod source;
pub mod stabilizer;
