use crate::config::Config;
use crate::registry::StreamRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SESSIONS_DIR: &str = "sessions";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(SESSIONS_DIR)).await?;
    Ok(())
}

/// Shared handles for the HTTP server and the ingest listener. The registry
/// is owned here and injected into both sides; neither reaches for a global.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub config: Arc<Config>,

    pub sessions_dir: PathBuf,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let workspace = PathBuf::from(&config.workspace);
        init_workspace(&workspace).await?;

        Ok(Self {
            registry: Arc::new(StreamRegistry::new()),
            config: Arc::new(config),
            sessions_dir: workspace.join(SESSIONS_DIR),
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        self.sessions_dir.as_path()
    }
}
