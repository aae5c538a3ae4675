//! Shared application state.
//!
use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sqlx::SqlitePool;

use crate::{
    config::Config, db::UserStore, jobs::JobRegistry, media::MediaBackend, nn::InferModel,
    session::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: UserStore,
    pub sessions: Arc<SessionStore>,
    pub jobs: Arc<JobRegistry>,
    pub model: Arc<dyn InferModel>,
    pub media: Arc<dyn MediaBackend>,
    /// Key signing the session cookie.
    pub key: Key,
}

impl AppState {
    pub fn new(config: Config, pool: SqlitePool, model: Arc<dyn InferModel>, key: Key) -> Self {
        let media = config.media_backend();
        Self {
            config: Arc::new(config),
            users: UserStore::new(pool),
            sessions: Arc::new(SessionStore::new()),
            jobs: Arc::new(JobRegistry::new()),
            model,
            media,
            key,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.key.clone()
    }
}
