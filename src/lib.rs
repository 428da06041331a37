pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod registry;
pub mod signals;
pub mod state;
pub mod util;
pub mod waypoint_config;
