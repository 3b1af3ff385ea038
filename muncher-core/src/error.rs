use muncher_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuncherError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Schedule {0} not found")]
    ScheduleNotFound(i64),

    #[error("Scan stats already exist for schedule {0}")]
    StatsExist(i64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuncherError>;
