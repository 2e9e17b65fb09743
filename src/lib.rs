pub mod config;
pub mod enrollment;
pub mod error;
pub mod telemetry;
