use std::sync::Arc;

use anyhow::Context;

use crate::config::AppPaths;
use crate::history::ChatHistoryStore;

#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub history: ChatHistoryStore,
}

impl AppState {
    pub async fn initialize() -> anyhow::Result<Arc<Self>> {
        let paths = Arc::new(AppPaths::new());
        let history = ChatHistoryStore::new(paths.db_path.clone())
            .await
            .context("failed to open history store")?;

        Ok(Arc::new(AppState { paths, history }))
    }
}
