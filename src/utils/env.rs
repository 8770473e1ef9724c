// src/utils/env.rs
use log::{debug, info};

const ENV_PATHS: [&str; 3] = [".env", ".env.local", "../.env"];

/// Loads the first `.env` file found. Variables already set in the process
/// environment take precedence.
pub fn load_env() {
    for path in ENV_PATHS {
        match dotenv::from_filename(path) {
            Ok(_) => {
                info!("Loaded environment variables from {}", path);
                return;
            }
            Err(e) => debug!("No environment loaded from {}: {}", path, e),
        }
    }
    info!("No .env file found, using environment variables from system");
}
