use actix_web::{web, App, HttpServer};
use log::{error, info, warn};
use log4rs;

use stow_engine::api;
use stow_engine::app_state::AppState;
use stow_engine::config::AppConfig;

fn init_logging(config: &AppConfig) {
    if let Err(e) = log4rs::init_file(&config.logging.config_file, Default::default()) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        warn!(
            "Could not load {} ({}), logging to stderr",
            config.logging.config_file, e
        );
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    init_logging(&config);

    let app_state = AppState::from_config(config.clone()).map_err(|e| {
        error!("Failed to initialize application state: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;

    let scheduler = if config.scheduler.enabled {
        Some(app_state.scheduler.clone().start_background())
    } else {
        warn!("Scheduler disabled, requests will only be recorded");
        None
    };

    info!("Starting server on {}:{}", config.server.host, config.server.port);
    let data = web::Data::new(app_state.clone());
    let result = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(data.clone())
            .configure(api::configure)
    })
    .workers(config.server.workers.max(1))
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await;

    if let Some(handle) = scheduler {
        handle.abort();
        if let Err(e) = app_state.scheduler.release() {
            warn!("Failed to release scheduler lease: {}", e);
        }
    }
    result
}
