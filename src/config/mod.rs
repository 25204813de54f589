/// Application configuration
pub mod app;
pub use app::{load_app_config, AppConfig, BazelConfig, SheetsConfig, DEFAULT_CONFIG_FILE};

/// Configuration traits
pub mod traits;
pub use traits::{Configuration, PathConfiguration};
