/// Fixed file locations, relative to the working directory the daemon is started in:
///   - procwatch.toml  Optional configuration, read once at startup.
///   - apps.json       Snapshot of detected processes, rewritten after every batch.
use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "procwatch.toml";
pub const OUTPUT_FILE_NAME: &str = "apps.json";

/// Returns the path to the config file: ./procwatch.toml
pub fn config_file_path() -> PathBuf {
    PathBuf::from(CONFIG_FILE_NAME)
}

/// Returns the path to the output document: ./apps.json
pub fn output_file_path() -> PathBuf {
    PathBuf::from(OUTPUT_FILE_NAME)
}
