//! vigild - analyzer daemon
//!
//! This daemon:
//! 1. Reads the environment into the process configuration
//! 2. Builds the engine (tenant store, dedup cache, incident pipeline)
//! 3. Serves the public API
//! 4. Runs until SIGINT, then drains the pipeline

use anyhow::Result;
use std::sync::mpsc;

use vigil_core::api::ApiServer;
use vigil_core::engine::{Engine, EngineDeps};
use vigil_core::Config;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::from_env()?;
    if cfg.admin_credential.is_none() {
        log::warn!("ADMIN_CREDENTIAL not set; /admin endpoints are disabled");
    }
    if cfg.vision.api_url.is_none() {
        log::warn!("VISION_API_URL not set; screening will fail closed until configured");
    }
    if cfg.evidence.store_base_url.is_none() {
        log::warn!("OBJECT_STORE_BASE_URL not set; evidence will be stored locally");
    }
    if cfg.smtp.host.is_none() {
        log::warn!("SMTP_HOST not set; alerts will be spooled offline");
    }

    let deps = EngineDeps::from_config(&cfg);
    let engine = Engine::new(cfg, deps)?;
    let api = ApiServer::new(engine.clone()).spawn()?;
    log::info!("vigild running, api on {}", api.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("vigild waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received");

    api.stop()?;
    engine.shutdown();
    Ok(())
}
