//! Detect server binary.
//!
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_extra::extract::cookie::Key;
use clap::Parser;
use detect_server::{
    config::Config, db, meter::spawn_meter_logger, nn::YoloModel, router::app_router,
    state::AppState,
};
use env_logger::{Env, TimestampPrecision};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let model = {
        let (path, labels, settings) = (
            config.model.clone(),
            config.labels.clone(),
            config.model_settings(),
        );
        tokio::task::spawn_blocking(move || YoloModel::new(&path, labels.as_deref(), settings))
            .await??
    };

    let pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("could not open database {}", config.database_url))?;

    let key = match &config.session_secret {
        Some(secret) => Key::try_from(secret.as_bytes())
            .context("session secret must be at least 64 bytes long")?,
        None => {
            log::warn!("No session secret set, sessions end with the process");
            Key::generate()
        }
    };

    for dir in [&config.uploads_dir, &config.runs_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    spawn_meter_logger();

    let addr = config.socket_addr()?;
    let state = AppState::new(config, pool, Arc::new(model), key);
    let app = app_router(state);

    log::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
