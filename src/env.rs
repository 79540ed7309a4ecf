use std::path::Path;

use tracing::{info, warn};

/// Env files read in order, later ones overriding earlier ones.
pub fn env_files(profile: &str) -> Vec<String> {
    vec![
        "config/common.env".to_string(),
        format!("config/{}.env", profile),
        ".secrets.env".to_string(),
    ]
}

pub fn load_environment() -> anyhow::Result<()> {
    let profile = dotenvy::var("APP_PROFILE").unwrap_or_else(|_| "development".to_string());

    for env_file in env_files(&profile) {
        load_env_file(&env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> anyhow::Result<()> {
    if !Path::new(path).exists() {
        warn!("Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)?;
    info!("Loaded environment from: {}", path);
    Ok(())
}
