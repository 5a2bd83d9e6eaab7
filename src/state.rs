use std::sync::Arc;

use reqwest::Client;
use sqlx::SqlitePool;

use crate::{config::Config, engine::TaskEngine, error::AppError, identity::IdentityGateway};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    pub http_client: Client,
    pub engine: Arc<TaskEngine>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: SqlitePool,
        gateway: Arc<dyn IdentityGateway>,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder().build().map_err(AppError::internal)?;
        let engine = TaskEngine::new(db.clone(), config.clone(), gateway)?;
        Ok(Self {
            config,
            db,
            http_client,
            engine: Arc::new(engine),
        })
    }
}
