pub mod catalog;
pub mod config;
pub mod data;
pub mod error;
pub mod report;
pub mod scan;

pub use catalog::{CookieCatalog, CookieCatalogBuilder, CookieCatalogEntry};
pub use config::ScanConfig;
pub use data::{Database, ScanStore};
pub use error::{MuncherError, Result};
