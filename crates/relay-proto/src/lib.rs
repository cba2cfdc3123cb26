pub mod command;
pub mod session;
pub mod telemetry;
