use colored::Colorize;
use config::{AppConfig, ConfigError};
use coview_collab::{Collab, DatabaseError, MemoryDatabase, PgDatabase};
use log::{error, info};
use thiserror::Error;
use tokio::runtime::{self, Runtime};

mod config;
mod demo;
mod events;
mod logging;

#[derive(Debug, Error)]
enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not initialize database: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session failed: {0}")]
    Session(anyhow::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl AppError {
    fn hint(&self) -> String {
        match self {
            AppError::Config(_) => "Check the COVIEW_* environment variables, or unset them to use the defaults.".to_string(),
            AppError::Database(_) => "This is a database error. Make sure the Postgres instance in COVIEW_DATABASE_URL is running and reachable, or unset it to keep rooms in memory.".to_string(),
            AppError::Session(_) => "A room session failed while running. Run again with COVIEW_VERBOSE=1 to see the sync decisions leading up to it.".to_string(),
            AppError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

fn build_runtime() -> Result<Runtime, AppError> {
    runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("coview-async")
        .build()
        .map_err(|e| AppError::Fatal(e.to_string()))
}

fn run(config: AppConfig) -> Result<(), AppError> {
    info!("Building async runtime...");
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        match config.database_url {
            Some(url) => {
                info!("Connecting to database...");
                let database = PgDatabase::new(&url).await?;
                database.migrate().await?;

                let collab = Collab::new(database, config.sync);
                demo::run(collab).await.map_err(AppError::Session)
            }
            None => {
                info!("No database configured, keeping rooms in memory");
                let collab = Collab::new(MemoryDatabase::new(), config.sync);
                demo::run(collab).await.map_err(AppError::Session)
            }
        }
    })
}

fn main() {
    let config = AppConfig::from_env();
    let verbose = config.as_ref().is_ok_and(|c| c.verbose);

    if let Err(error) = logging::init_logger(verbose) {
        eprintln!("Could not initialize logging: {}", error);
        return;
    }

    match config.map_err(AppError::from).and_then(run) {
        Ok(()) => info!("Session finished."),
        Err(error) => {
            error!("{} Read the error below to troubleshoot the issue. If you think this might be a bug, please report it by making a GitHub issue.", "coview failed!".bold().red());
            error!("{}", error);
            error!("{}", format!("Hint: {}", error.hint()).dimmed().italic());
        }
    }
}
