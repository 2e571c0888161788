pub mod classifier;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod entity;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod recommender;
pub mod store;
pub mod types;

pub use error::{GigError, Result};
