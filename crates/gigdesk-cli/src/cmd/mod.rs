pub mod actions;
pub mod config;
pub mod engine;
pub mod import;
pub mod lead;
pub mod log;
pub mod stalls;
