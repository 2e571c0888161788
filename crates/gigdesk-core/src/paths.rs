use crate::error::{GigError, Result};
use std::path::{Path, PathBuf};

pub const DATA_DIR: &str = ".gigdesk";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DB_FILE: &str = "gigdesk.redb";

/// `~/.gigdesk`
pub fn default_data_dir() -> Result<PathBuf> {
    let home = home::home_dir().ok_or(GigError::HomeNotFound)?;
    Ok(home.join(DATA_DIR))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}
