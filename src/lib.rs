// ABOUTME: Library root for telemetry-sync
// ABOUTME: Exports the discovery, mapping, planning and transfer modules used by the CLI

pub mod config;
pub mod destination;
pub mod driver;
pub mod engine;
pub mod error;
pub mod line_protocol;
pub mod lock;
pub mod mapper;
pub mod planner;
pub mod scanner;
pub mod source;
pub mod state;
pub mod transfer;
pub mod utils;
