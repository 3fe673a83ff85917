// Public API - only expose the runner module
pub mod runner;

// Internal modules - organized by subsystem
mod acquisition;
mod config;
mod coordination;
mod dispatch;
mod fwi;
mod io;
mod solver;
mod telemetry;
