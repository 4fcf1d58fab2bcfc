// Lookout - motion-triggered surveillance recorder
// Main library entry point

pub mod config;
pub mod encoding;
pub mod recording;
pub mod status;
pub mod video;
