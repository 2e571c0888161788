use anyhow::Context as _;
use gigdesk_core::clock::SystemClock;
use gigdesk_core::config::EngineConfig;
use gigdesk_core::delivery;
use gigdesk_core::orchestrator::Engine;
use gigdesk_core::paths;
use gigdesk_core::store::RedbStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolve the data directory.
///
/// Priority:
/// 1. `--data-dir` flag / `GIGDESK_DIR` env var (passed in as `explicit`)
/// 2. `~/.gigdesk`
pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => paths::default_data_dir().context("cannot locate default data directory"),
    }
}

/// Everything a command needs: validated config plus the open store.
pub struct Context {
    pub config: EngineConfig,
    pub store: Arc<RedbStore>,
}

impl Context {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let config_path = paths::config_path(data_dir);
        let config = EngineConfig::load_validated(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        for w in config.validate() {
            tracing::warn!("config: {}", w.message);
        }
        let db_path = paths::db_path(data_dir);
        let store = RedbStore::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn engine(&self) -> anyhow::Result<Arc<Engine>> {
        let delivery =
            delivery::from_config(&self.config.delivery).context("failed to build delivery")?;
        Ok(Arc::new(Engine::new(
            self.store.clone(),
            delivery,
            Arc::new(SystemClock),
            self.config.clone(),
        )))
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start tokio runtime")
}
