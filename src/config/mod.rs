pub mod settings;

pub use settings::Config;

use crate::error::{DeskError, Result};
use std::sync::Arc;

/// Loads, validates and logs the application configuration.
pub fn load_config() -> Result<Arc<Config>> {
    dotenv::dotenv().ok();
    let config = Config::from_env();
    if config.api_base_url.is_empty() {
        return Err(DeskError::Config(
            "DESK_API_BASE_URL cannot be empty".to_string(),
        ));
    }
    config.validate_and_log();
    Ok(Arc::new(config))
}
