//! WebSocket chat relay that streams model output and runs the Lua it writes.

pub mod cli;
pub mod config;
pub mod relay;
pub mod router;
pub mod telemetry;
pub mod ui;
