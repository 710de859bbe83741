//! Environment constants and path utilities for the portal runner.
//!
//! Config file names and locations live here so the CLI and its tests agree
//! on where configuration is looked up.

use std::path::{Path, PathBuf};

/// Application name, used for directory names
pub const APP_NAME: &str = "portal-runner";

/// Config file looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "portal-runner.toml";

/// Config file name inside the user config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Directory under the home directory holding per-user configuration
pub const USER_CONFIG_PARENT_DIR: &str = ".config";

/// Log filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "portal_runner=info";

/// Filter used with `--verbose`
pub const VERBOSE_LOG_FILTER: &str = "portal_runner=debug";

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(USER_CONFIG_PARENT_DIR).join(APP_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in the given directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}
