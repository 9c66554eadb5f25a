//! Loading [`SessionConfig`]s from RON, TOML or JSON files.
//!
//! Missing fields take their defaults, and every loaded config is
//! validated before it is returned.

pub mod loader;

use std::path::Path;

use rewind_core::config::SessionConfig;

pub use loader::{DataLoadError, Format, detect_format};

/// Base name [`load_session_config_from_dir`] looks for.
pub const SESSION_FILE: &str = "session";

/// Load and validate a session config from `path`.
pub fn load_session_config(path: &Path) -> Result<SessionConfig, DataLoadError> {
    let config: SessionConfig = loader::deserialize_file(path)?;
    validated(config, path)
}

/// Load and validate a session config from an in-memory document.
pub fn parse_session_config(content: &str, format: Format) -> Result<SessionConfig, DataLoadError> {
    let origin = Path::new("<inline>");
    let config: SessionConfig = loader::deserialize_str(content, format, origin)?;
    validated(config, origin)
}

/// Load `session.{ron,toml,json}` from `dir`.
pub fn load_session_config_from_dir(dir: &Path) -> Result<SessionConfig, DataLoadError> {
    let path = loader::require_data_file(dir, SESSION_FILE)?;
    load_session_config(&path)
}

fn validated(config: SessionConfig, file: &Path) -> Result<SessionConfig, DataLoadError> {
    config.validate().map_err(|source| DataLoadError::Invalid {
        file: file.to_path_buf(),
        source,
    })?;
    log::debug!(
        "loaded session config {} from {}: {} players at {} Hz",
        config.config_id,
        file.display(),
        config.player_count,
        config.simulation_rate
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
