//! Logging configuration for Multicon.
//!
//! Logs go to stderr by default so query output on stdout stays clean for
//! piping. `--log-file` redirects them to a file in the platform state directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes logging to stderr.
pub fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Initializes logging to the log file returned by [`get_log_path`].
///
/// Falls back to stderr logging if the file cannot be opened.
pub fn init_file_logging() {
    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            init_stderr_logging();
            return;
        }
    }

    let log_file = match open_log_file(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            init_stderr_logging();
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(log_file)
        .with_ansi(false)
        .init();
}

/// Opens the log file, truncating it so each run starts empty.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    File::create(path)
}

/// Returns the path for the log file.
///
/// Uses XDG state directory on Linux (`~/.local/state/multicon/multicon.log`),
/// or falls back to config directory on other platforms.
pub fn get_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("multicon").join("multicon.log");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("multicon").join("multicon.log");
    }

    std::env::temp_dir().join("multicon.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_is_absolute() {
        let path = get_log_path();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_log_path_ends_with_multicon_log() {
        let path = get_log_path();
        assert!(path.ends_with("multicon.log"));
    }

    #[test]
    fn test_log_file_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multicon.log");
        fs::write(&path, "previous run\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        std::io::Write::write_all(&mut file, b"this run\n").unwrap();
        drop(file);

        assert_eq!(fs::read_to_string(&path).unwrap(), "this run\n");
    }
}
